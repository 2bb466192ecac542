//! **AudioSession**: the single output device, PCM16 decoding and cue tones.
//!
//! The device is created lazily on first use, resumed on demand and released
//! exactly once at teardown. Response playback goes through [`OutputDevice::play`];
//! cue tones use [`OutputDevice::play_cue`] and never count as the active sound.

use crate::error::{VoiceError, VoiceResult};
use base64::prelude::*;
use std::f32::consts::TAU;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Sample rate of synthesized speech payloads.
pub const PCM_SAMPLE_RATE: u32 = 24_000;

/// Decoded audio, one `Vec<f32>` per channel, samples in [-1.0, 1.0).
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    channels: Vec<Vec<f32>>,
    sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(channels: Vec<Vec<f32>>, sample_rate: u32) -> Self {
        Self {
            channels,
            sample_rate,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn frame_count(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.channels.get(index).map(Vec::as_slice)
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frame_count() as f64 / self.sample_rate as f64)
    }

    /// Frame-interleaved samples, as audio sinks expect them.
    pub fn interleaved(&self) -> Vec<f32> {
        let frames = self.frame_count();
        let mut out = Vec::with_capacity(frames * self.channels.len());
        for i in 0..frames {
            for channel in &self.channels {
                out.push(channel[i]);
            }
        }
        out
    }
}

/// Decode a base64 PCM16 little-endian payload.
pub fn decode_pcm16_base64(
    payload: &str,
    sample_rate: u32,
    channels: u16,
) -> VoiceResult<AudioBuffer> {
    let bytes = BASE64_STANDARD
        .decode(payload.trim())
        .map_err(|e| VoiceError::Decode(format!("base64: {}", e)))?;
    Ok(decode_pcm16(&bytes, sample_rate, channels))
}

/// Interpret raw bytes as interleaved PCM16 LE. A trailing orphan byte is dropped.
pub fn decode_pcm16(bytes: &[u8], sample_rate: u32, channels: u16) -> AudioBuffer {
    let channel_count = channels.max(1) as usize;
    let even = bytes.len() - bytes.len() % 2;
    let samples: Vec<i16> = bytes[..even]
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect();

    let frame_count = samples.len() / channel_count;
    let data = (0..channel_count)
        .map(|channel| {
            (0..frame_count)
                .map(|i| samples[i * channel_count + channel] as f32 / 32768.0)
                .collect()
        })
        .collect();

    AudioBuffer::new(data, sample_rate)
}

/// Short synthetic tones marking session events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CueKind {
    /// Session became attentive.
    Start,
    /// Turn finalized.
    End,
    /// Speech detected while listening.
    Detect,
}

struct CueShape {
    freq_from: f32,
    freq_to: f32,
    sweep: f32,
    peak: f32,
    attack: f32,
    length: f32,
}

impl CueKind {
    fn shape(self) -> CueShape {
        match self {
            CueKind::Start => CueShape {
                freq_from: 880.0,
                freq_to: 1320.0,
                sweep: 0.1,
                peak: 0.1,
                attack: 0.02,
                length: 0.15,
            },
            CueKind::End => CueShape {
                freq_from: 660.0,
                freq_to: 440.0,
                sweep: 0.1,
                peak: 0.1,
                attack: 0.02,
                length: 0.15,
            },
            CueKind::Detect => CueShape {
                freq_from: 1100.0,
                freq_to: 1100.0,
                sweep: 0.0,
                peak: 0.05,
                attack: 0.01,
                length: 0.05,
            },
        }
    }
}

/// Render a mono sine cue: exponential frequency sweep, linear attack/release envelope.
pub fn render_cue(kind: CueKind, sample_rate: u32) -> AudioBuffer {
    let shape = kind.shape();
    let rate = sample_rate.max(1) as f32;
    let total = (shape.length * rate).round() as usize;
    let mut phase = 0.0f32;
    let mut samples = Vec::with_capacity(total);

    for n in 0..total {
        let t = n as f32 / rate;
        let freq = if shape.sweep > 0.0 && t < shape.sweep {
            shape.freq_from * (shape.freq_to / shape.freq_from).powf(t / shape.sweep)
        } else {
            shape.freq_to
        };
        let gain = if t < shape.attack {
            shape.peak * t / shape.attack
        } else {
            shape.peak * (1.0 - (t - shape.attack) / (shape.length - shape.attack)).max(0.0)
        };
        samples.push(phase.sin() * gain);
        phase = (phase + TAU * freq / rate) % TAU;
    }

    AudioBuffer::new(vec![samples], sample_rate)
}

pub type SoundId = u64;

/// A started sound. `done` resolves on natural completion; it is dropped
/// without a value when the sound is stopped.
#[derive(Debug)]
pub struct SoundPlayback {
    pub id: SoundId,
    pub done: oneshot::Receiver<()>,
}

/// Output device backend (rodio in production, fakes in tests).
pub trait OutputDevice: Send + Sync {
    fn play(&self, buffer: AudioBuffer) -> VoiceResult<SoundPlayback>;
    fn stop(&self, id: SoundId);
    /// Fire-and-forget tone mixed alongside any playing response.
    fn play_cue(&self, buffer: AudioBuffer) -> VoiceResult<()>;
    fn suspend(&self) -> VoiceResult<()>;
    fn resume(&self) -> VoiceResult<()>;
    fn is_suspended(&self) -> bool;
    fn close(&self);
}

/// Creates the output device on first use.
pub trait DeviceFactory: Send + Sync {
    fn open(&self) -> VoiceResult<Arc<dyn OutputDevice>>;
}

/// Owns the process-wide output device handle.
pub struct AudioSession {
    factory: Arc<dyn DeviceFactory>,
    device: Option<Arc<dyn OutputDevice>>,
    cue_sample_rate: u32,
    closed: bool,
}

impl AudioSession {
    pub fn new(factory: Arc<dyn DeviceFactory>, cue_sample_rate: u32) -> Self {
        Self {
            factory,
            device: None,
            cue_sample_rate,
            closed: false,
        }
    }

    /// Create the device if absent and resume it if suspended. Idempotent.
    pub fn ensure_active(&mut self) -> VoiceResult<Arc<dyn OutputDevice>> {
        if self.closed {
            return Err(VoiceError::SessionClosed);
        }
        let device = match &self.device {
            Some(device) => Arc::clone(device),
            None => {
                let device = self.factory.open()?;
                info!("AudioSession: output device opened");
                self.device = Some(Arc::clone(&device));
                device
            }
        };
        if device.is_suspended() {
            device.resume()?;
        }
        Ok(device)
    }

    /// Play a cue tone. Failures are logged, never returned.
    pub fn play_cue(&mut self, kind: CueKind) {
        let device = match self.ensure_active() {
            Ok(device) => device,
            Err(e) => {
                warn!(error = %e, ?kind, "cue skipped");
                return;
            }
        };
        if let Err(e) = device.play_cue(render_cue(kind, self.cue_sample_rate)) {
            warn!(error = %e, ?kind, "cue playback failed");
        }
    }

    /// Pause the output clock. No-op without a device or when already suspended.
    pub fn suspend(&mut self) -> VoiceResult<()> {
        match &self.device {
            Some(device) if !self.closed && !device.is_suspended() => device.suspend(),
            _ => Ok(()),
        }
    }

    pub fn resume(&mut self) -> VoiceResult<()> {
        match &self.device {
            Some(device) if !self.closed && device.is_suspended() => device.resume(),
            _ => Ok(()),
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.device.as_ref().map(|d| d.is_suspended()).unwrap_or(false)
    }

    pub fn device(&self) -> Option<Arc<dyn OutputDevice>> {
        self.device.clone()
    }

    /// Release the device. Safe when it was never created; later calls are no-ops.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(device) = self.device.take() {
            device.close();
            debug!("AudioSession: output device closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
