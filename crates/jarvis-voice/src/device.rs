//! **RodioDevice**: the production [`OutputDevice`].
//!
//! rodio's `OutputStream` is not `Send`, so it lives on a dedicated thread that
//! owns every `Sink`. The handle talks to it over a command channel and the thread
//! polls sinks for natural completion.

use crate::audio::{AudioBuffer, DeviceFactory, OutputDevice, SoundId, SoundPlayback};
use crate::error::{VoiceError, VoiceResult};
use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, OutputStreamHandle, Sink};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

enum DeviceCommand {
    Play {
        id: SoundId,
        buffer: AudioBuffer,
        done: oneshot::Sender<()>,
    },
    Cue(AudioBuffer),
    Stop(SoundId),
    Suspend,
    Resume,
    Close,
}

pub struct RodioDevice {
    commands: mpsc::Sender<DeviceCommand>,
    next_id: AtomicU64,
    suspended: AtomicBool,
    closed: AtomicBool,
}

impl RodioDevice {
    /// Open the default output device on its own thread.
    pub fn open() -> VoiceResult<Self> {
        let (commands, rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();

        thread::Builder::new()
            .name("jarvis-audio-out".to_string())
            .spawn(move || run_output_thread(rx, ready_tx))?;

        ready_rx.recv().map_err(|_| {
            VoiceError::AudioDevice("output thread exited during startup".to_string())
        })??;

        info!("RodioDevice: default output ready");
        Ok(Self {
            commands,
            next_id: AtomicU64::new(1),
            suspended: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    fn send(&self, command: DeviceCommand) -> VoiceResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(VoiceError::SessionClosed);
        }
        self.commands
            .send(command)
            .map_err(|e| VoiceError::ChannelSend(e.to_string()))
    }
}

impl OutputDevice for RodioDevice {
    fn play(&self, buffer: AudioBuffer) -> VoiceResult<SoundPlayback> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (done_tx, done) = oneshot::channel();
        self.send(DeviceCommand::Play {
            id,
            buffer,
            done: done_tx,
        })?;
        Ok(SoundPlayback { id, done })
    }

    fn stop(&self, id: SoundId) {
        if let Err(e) = self.send(DeviceCommand::Stop(id)) {
            debug!(error = %e, sound = id, "stop ignored");
        }
    }

    fn play_cue(&self, buffer: AudioBuffer) -> VoiceResult<()> {
        self.send(DeviceCommand::Cue(buffer))
    }

    fn suspend(&self) -> VoiceResult<()> {
        self.send(DeviceCommand::Suspend)?;
        self.suspended.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn resume(&self) -> VoiceResult<()> {
        self.send(DeviceCommand::Resume)?;
        self.suspended.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    fn close(&self) {
        let _ = self.commands.send(DeviceCommand::Close);
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct ActiveSound {
    id: SoundId,
    sink: Sink,
    done: Option<oneshot::Sender<()>>,
}

fn new_sink(handle: &OutputStreamHandle, buffer: AudioBuffer, paused: bool) -> Option<Sink> {
    let sink = match Sink::try_new(handle) {
        Ok(sink) => sink,
        Err(e) => {
            warn!(error = %e, "RodioDevice: sink creation failed");
            return None;
        }
    };
    if paused {
        sink.pause();
    }
    let channels = buffer.channel_count().max(1) as u16;
    sink.append(SamplesBuffer::new(channels, buffer.sample_rate(), buffer.interleaved()));
    Some(sink)
}

fn run_output_thread(rx: mpsc::Receiver<DeviceCommand>, ready: mpsc::Sender<VoiceResult<()>>) {
    let (_stream, handle) = match OutputStream::try_default() {
        Ok(pair) => pair,
        Err(e) => {
            let _ = ready.send(Err(VoiceError::AudioDevice(e.to_string())));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    let mut sounds: Vec<ActiveSound> = Vec::new();
    let mut cues: Vec<Sink> = Vec::new();
    let mut suspended = false;

    loop {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(DeviceCommand::Play { id, buffer, done }) => {
                // A dropped `done` tells the waiter the sound never completed.
                if let Some(sink) = new_sink(&handle, buffer, suspended) {
                    sounds.push(ActiveSound {
                        id,
                        sink,
                        done: Some(done),
                    });
                }
            }
            Ok(DeviceCommand::Cue(buffer)) => {
                if let Some(sink) = new_sink(&handle, buffer, false) {
                    cues.push(sink);
                }
            }
            Ok(DeviceCommand::Stop(id)) => {
                sounds.retain(|sound| {
                    if sound.id == id {
                        sound.sink.stop();
                        false
                    } else {
                        true
                    }
                });
            }
            Ok(DeviceCommand::Suspend) => {
                suspended = true;
                sounds.iter().for_each(|s| s.sink.pause());
            }
            Ok(DeviceCommand::Resume) => {
                suspended = false;
                sounds.iter().for_each(|s| s.sink.play());
            }
            Ok(DeviceCommand::Close) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        sounds.retain_mut(|sound| {
            if !sound.sink.empty() {
                return true;
            }
            if let Some(done) = sound.done.take() {
                let _ = done.send(());
            }
            debug!(sound = sound.id, "RodioDevice: playback finished");
            false
        });
        cues.retain(|sink| !sink.empty());
    }

    sounds.iter().for_each(|s| s.sink.stop());
    debug!("RodioDevice: output thread stopped");
}

/// Opens a [`RodioDevice`] on the default output.
#[derive(Debug, Default, Clone, Copy)]
pub struct RodioDeviceFactory;

impl DeviceFactory for RodioDeviceFactory {
    fn open(&self) -> VoiceResult<Arc<dyn OutputDevice>> {
        Ok(Arc::new(RodioDevice::open()?))
    }
}
