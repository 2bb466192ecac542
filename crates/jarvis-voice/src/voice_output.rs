//! **VoiceOutputPlayer**: response playback with remote synthesis, local fallback
//! and barge-in.
//!
//! The player is driven from the controller's event loop and never blocks it:
//! remote synthesis runs on a spawned task and reports back through the
//! [`PlayerNotifier`]. Every request and every playback handle carries a fresh
//! id so completions that arrive after being superseded are rejected.

use crate::audio::{decode_pcm16_base64, AudioBuffer, AudioSession, CueKind, OutputDevice, SoundId};
use crate::config::{FallbackConfig, SynthesisConfig};
use crate::error::{CollaboratorError, VoiceResult};
use crate::local_tts::{
    choose_voice, LocalSpeechControl, LocalSpeechEnd, LocalSynthesizer, LocalUtterance,
};
use crate::retry::{with_retry, RetryPolicy};
use crate::sanitize::sanitize_for_speech;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Remote speech synthesis. Returns base64 PCM16 LE audio.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<String, CollaboratorError>;
}

/// Which output mechanism a handle uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackPath {
    /// Decoded PCM through the shared audio device.
    Primary,
    /// Local device-native synthesis.
    Fallback,
}

/// One in-flight audio output. At most one is active at a time.
pub trait PlaybackHandle: Send {
    fn id(&self) -> u64;
    fn path(&self) -> PlaybackPath;
    fn stop(&mut self);
    fn pause(&mut self) -> VoiceResult<()>;
    fn resume(&mut self) -> VoiceResult<()>;
}

/// Decoded-buffer playback; pause suspends the whole device.
struct BufferPlayback {
    id: u64,
    device: Arc<dyn OutputDevice>,
    sound: SoundId,
}

impl PlaybackHandle for BufferPlayback {
    fn id(&self) -> u64 {
        self.id
    }

    fn path(&self) -> PlaybackPath {
        PlaybackPath::Primary
    }

    fn stop(&mut self) {
        self.device.stop(self.sound);
    }

    fn pause(&mut self) -> VoiceResult<()> {
        self.device.suspend()
    }

    fn resume(&mut self) -> VoiceResult<()> {
        self.device.resume()
    }
}

/// Local synthesis playback; pause uses the engine's own control.
struct FallbackPlayback {
    id: u64,
    control: Arc<dyn LocalSpeechControl>,
}

impl PlaybackHandle for FallbackPlayback {
    fn id(&self) -> u64 {
        self.id
    }

    fn path(&self) -> PlaybackPath {
        PlaybackPath::Fallback
    }

    fn stop(&mut self) {
        self.control.cancel();
    }

    fn pause(&mut self) -> VoiceResult<()> {
        self.control.pause();
        Ok(())
    }

    fn resume(&mut self) -> VoiceResult<()> {
        self.control.resume();
        Ok(())
    }
}

/// Completion reports posted back to the owner of the player.
#[derive(Debug)]
pub enum PlayerEvent {
    Synthesized {
        request: u64,
        outcome: Result<AudioBuffer, SynthesisFailure>,
    },
    Finished {
        handle: u64,
    },
}

/// Why the remote path produced no playable audio.
#[derive(Debug, Clone, PartialEq)]
pub enum SynthesisFailure {
    Remote(CollaboratorError),
    Undecodable(String),
}

pub type PlayerNotifier = Arc<dyn Fn(PlayerEvent) + Send + Sync>;

/// Result of asking the player to speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakOutcome {
    /// Nothing to say; the turn is done.
    Skipped,
    /// Remote synthesis in flight under this request id.
    Pending(u64),
    Started(PlaybackPath),
    /// Neither path could produce audio.
    Failed,
}

struct PendingSynthesis {
    request: u64,
    text: String,
    task: JoinHandle<()>,
}

pub struct VoiceOutputPlayer {
    session: AudioSession,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    local: Option<Arc<dyn LocalSynthesizer>>,
    synthesis: SynthesisConfig,
    fallback: FallbackConfig,
    local_voice: Option<String>,
    notify: PlayerNotifier,
    next_id: u64,
    pending: Option<PendingSynthesis>,
    active: Option<Box<dyn PlaybackHandle>>,
    paused: bool,
    quota_until: Option<Instant>,
}

impl VoiceOutputPlayer {
    pub fn new(
        session: AudioSession,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        local: Option<Arc<dyn LocalSynthesizer>>,
        synthesis: SynthesisConfig,
        fallback: FallbackConfig,
        notify: PlayerNotifier,
    ) -> Self {
        let local_voice = local
            .as_ref()
            .and_then(|l| choose_voice(&l.voices(), &fallback.preferred_voices));
        if let Some(voice) = &local_voice {
            debug!(voice = %voice, "fallback voice selected");
        }
        Self {
            session,
            synthesizer,
            local,
            synthesis,
            fallback,
            local_voice,
            notify,
            next_id: 0,
            pending: None,
            active: None,
            paused: false,
            quota_until: None,
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Begin speaking `text`, superseding whatever was playing or pending.
    pub fn speak(&mut self, text: &str, online: bool) -> SpeakOutcome {
        self.interrupt();
        if text.trim().is_empty() {
            return SpeakOutcome::Skipped;
        }
        let spoken = sanitize_for_speech(text);

        if let Err(e) = self.session.ensure_active() {
            warn!(error = %e, "audio device unavailable, using local synthesis");
            return self.start_fallback(spoken);
        }

        let cooling_down = self.quota_until.map(|t| Instant::now() < t).unwrap_or(false);
        if !online || cooling_down {
            debug!(online, cooling_down, "skipping remote synthesis");
            return self.start_fallback(spoken);
        }

        let request = self.next_id();
        let synthesizer = Arc::clone(&self.synthesizer);
        let notify = Arc::clone(&self.notify);
        let policy = RetryPolicy::new(self.synthesis.max_attempts, self.synthesis.base_delay());
        let sample_rate = self.synthesis.sample_rate;
        let channels = self.synthesis.channels;
        let text = spoken.clone();

        let task = tokio::spawn(async move {
            let remote = with_retry(
                &policy,
                "synthesis",
                |_| synthesizer.synthesize(&text),
                CollaboratorError::is_transient,
            )
            .await;
            let outcome = match remote {
                Ok(payload) => decode_pcm16_base64(&payload, sample_rate, channels)
                    .map_err(|e| SynthesisFailure::Undecodable(e.to_string()))
                    .and_then(|buffer| {
                        if buffer.frame_count() == 0 {
                            Err(SynthesisFailure::Remote(CollaboratorError::EmptyPayload))
                        } else {
                            Ok(buffer)
                        }
                    }),
                Err(e) => Err(SynthesisFailure::Remote(e)),
            };
            notify(PlayerEvent::Synthesized { request, outcome });
        });

        self.pending = Some(PendingSynthesis {
            request,
            text: spoken,
            task,
        });
        SpeakOutcome::Pending(request)
    }

    /// Apply a synthesis result. `None` means the request was superseded.
    pub fn on_synthesized(
        &mut self,
        request: u64,
        outcome: Result<AudioBuffer, SynthesisFailure>,
    ) -> Option<SpeakOutcome> {
        match &self.pending {
            Some(p) if p.request == request => {}
            _ => {
                debug!(request, "stale synthesis result ignored");
                return None;
            }
        }
        let pending = self.pending.take()?;

        match outcome {
            Ok(buffer) => Some(self.start_buffer(buffer, pending.text)),
            Err(failure) => {
                // A quota error that outlived the retries opens the cooldown.
                if let SynthesisFailure::Remote(e) = &failure {
                    if e.is_quota() {
                        let cooldown = self.synthesis.quota_cooldown();
                        self.quota_until = Some(Instant::now() + cooldown);
                        warn!(?cooldown, "synthesis quota exhausted");
                    }
                }
                warn!(?failure, "remote synthesis failed, falling back to local voice");
                Some(self.start_fallback(pending.text))
            }
        }
    }

    fn start_buffer(&mut self, buffer: AudioBuffer, text: String) -> SpeakOutcome {
        self.stop_active();
        let device = match self.session.ensure_active() {
            Ok(device) => device,
            Err(e) => {
                warn!(error = %e, "audio device unavailable");
                return self.start_fallback(text);
            }
        };
        let frames = buffer.frame_count();
        let playback = match device.play(buffer) {
            Ok(playback) => playback,
            Err(e) => {
                warn!(error = %e, "buffer playback failed");
                return self.start_fallback(text);
            }
        };

        let id = self.next_id();
        let sound = playback.id;
        let done = playback.done;
        self.watch_completion(id, async move { done.await.is_ok() });
        self.active = Some(Box::new(BufferPlayback { id, device, sound }));
        info!(handle = id, frames, "speaking (primary)");
        SpeakOutcome::Started(PlaybackPath::Primary)
    }

    fn start_fallback(&mut self, text: String) -> SpeakOutcome {
        self.stop_active();
        let local = match &self.local {
            Some(local) => Arc::clone(local),
            None => {
                warn!("no local synthesizer available");
                return SpeakOutcome::Failed;
            }
        };
        let utterance = LocalUtterance {
            text,
            rate: self.fallback.rate,
            pitch: self.fallback.pitch,
            voice: self.local_voice.clone(),
        };
        let speech = match local.speak(utterance) {
            Ok(speech) => speech,
            Err(e) => {
                warn!(error = %e, "local synthesis failed to start");
                return SpeakOutcome::Failed;
            }
        };

        let id = self.next_id();
        let done = speech.done;
        self.watch_completion(id, async move {
            match done.await {
                Ok(LocalSpeechEnd::Finished) => true,
                Ok(LocalSpeechEnd::Failed(reason)) => {
                    warn!(reason = %reason, "local utterance failed");
                    true
                }
                Ok(LocalSpeechEnd::Cancelled) | Err(_) => false,
            }
        });
        self.active = Some(Box::new(FallbackPlayback {
            id,
            control: speech.control,
        }));
        info!(handle = id, "speaking (fallback)");
        SpeakOutcome::Started(PlaybackPath::Fallback)
    }

    /// Report `Finished` for `handle` once `ended` resolves to true.
    fn watch_completion<F>(&self, handle: u64, ended: F)
    where
        F: std::future::Future<Output = bool> + Send + 'static,
    {
        let notify = Arc::clone(&self.notify);
        tokio::spawn(async move {
            if ended.await {
                notify(PlayerEvent::Finished { handle });
            }
        });
    }

    /// True if `handle` was the active one; it is released.
    pub fn on_finished(&mut self, handle: u64) -> bool {
        match &self.active {
            Some(active) if active.id() == handle => {
                self.active = None;
                self.clear_pause();
                debug!(handle, "playback finished");
                true
            }
            _ => {
                debug!(handle, "stale playback completion ignored");
                false
            }
        }
    }

    fn stop_active(&mut self) {
        if let Some(mut active) = self.active.take() {
            active.stop();
            debug!(handle = active.id(), "playback stopped");
        }
        self.clear_pause();
    }

    fn clear_pause(&mut self) {
        if self.paused {
            self.paused = false;
            if let Err(e) = self.session.resume() {
                warn!(error = %e, "failed to resume audio device");
            }
        }
    }

    /// Cancel pending synthesis and stop the active handle.
    pub fn interrupt(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.task.abort();
            debug!(request = pending.request, "pending synthesis cancelled");
        }
        self.stop_active();
    }

    /// Flip pause on the active handle. Returns the new paused flag, or `None`
    /// when nothing is playing.
    pub fn toggle_pause(&mut self) -> Option<bool> {
        let active = self.active.as_mut()?;
        let result = if self.paused {
            active.resume()
        } else {
            active.pause()
        };
        match result {
            Ok(()) => {
                self.paused = !self.paused;
                Some(self.paused)
            }
            Err(e) => {
                warn!(error = %e, "pause toggle failed");
                Some(self.paused)
            }
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn active_path(&self) -> Option<PlaybackPath> {
        self.active.as_ref().map(|a| a.path())
    }

    pub fn ensure_device(&mut self) {
        if let Err(e) = self.session.ensure_active() {
            warn!(error = %e, "audio device unavailable");
        }
    }

    pub fn play_cue(&mut self, kind: CueKind) {
        self.session.play_cue(kind);
    }

    /// Stop everything and release the device. Idempotent.
    pub fn close(&mut self) {
        self.interrupt();
        self.session.close();
    }
}

impl Drop for VoiceOutputPlayer {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.task.abort();
        }
    }
}
