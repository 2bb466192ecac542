//! **SpeechInputStream**: continuous recognition over a restartable primitive.
//!
//! A recognition session ends on its own after every utterance or silence gap.
//! A supervisor task restarts it after a short delay so the consumer sees one
//! unbroken [`Stream`] of [`SpeechEvent`]s. Restarts stop for good once
//! [`SpeechInputControl::stop`] is called, and pause while the session is in ERROR.

use crate::error::VoiceResult;
use crate::state::AssistantState;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const EVENT_BUFFER: usize = 64;
/// Ceiling for the restart delay after repeated start failures.
const MAX_RESTART_BACKOFF: Duration = Duration::from_secs(5);

/// Error codes reported by a recognition session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionErrorCode {
    NoSpeech,
    AudioCapture,
    Aborted,
    PermissionDenied,
    Other(String),
}

impl RecognitionErrorCode {
    pub fn parse(code: &str) -> Self {
        match code.trim().to_ascii_lowercase().as_str() {
            "no-speech" => RecognitionErrorCode::NoSpeech,
            "audio-capture" => RecognitionErrorCode::AudioCapture,
            "aborted" => RecognitionErrorCode::Aborted,
            "not-allowed" | "permission-denied" | "service-not-allowed" => {
                RecognitionErrorCode::PermissionDenied
            }
            other => RecognitionErrorCode::Other(other.to_string()),
        }
    }

    /// Benign noise: swallowed and followed by a restart.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RecognitionErrorCode::NoSpeech
                | RecognitionErrorCode::AudioCapture
                | RecognitionErrorCode::Aborted
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, RecognitionErrorCode::PermissionDenied)
    }
}

/// One item from a single recognition session.
#[derive(Debug, Clone, PartialEq)]
pub enum RawRecognition {
    Interim(String),
    Final(String),
    Error(RecognitionErrorCode),
}

/// Session-fatal input conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFailure {
    PermissionDenied,
    Unavailable,
}

impl InputFailure {
    pub fn message(&self) -> &'static str {
        match self {
            InputFailure::PermissionDenied => "Mic access denied.",
            InputFailure::Unavailable => "Speech recognition unavailable.",
        }
    }
}

/// What the consumer sees. Interim text replaces earlier interim text.
#[derive(Debug, Clone, PartialEq)]
pub enum SpeechEvent {
    Interim(String),
    Final(String),
    Error(InputFailure),
}

/// Host recognition capability.
#[async_trait]
pub trait Recognizer: Send + Sync {
    /// Whether the host offers recognition at all. Checked once at startup.
    fn is_available(&self) -> bool {
        true
    }

    /// Start one recognition session. It ends when the receiver closes.
    async fn start(&self, language: &str) -> VoiceResult<mpsc::Receiver<RawRecognition>>;
}

#[derive(Debug, Clone)]
pub struct SpeechInputOptions {
    pub language: String,
    pub restart_delay: Duration,
}

impl Default for SpeechInputOptions {
    fn default() -> Self {
        Self {
            language: "en-US".to_string(),
            restart_delay: Duration::from_millis(100),
        }
    }
}

/// Idempotent stop switch shared with the supervisor.
#[derive(Debug, Clone)]
pub struct SpeechInputControl {
    stop: Arc<watch::Sender<bool>>,
}

impl SpeechInputControl {
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }
}

pub struct SpeechInputStream {
    events: mpsc::Receiver<SpeechEvent>,
    control: SpeechInputControl,
    supervisor: JoinHandle<()>,
}

impl SpeechInputStream {
    /// Spawn the supervisor. `session` gates restarts while it reads ERROR.
    pub fn spawn(
        recognizer: Arc<dyn Recognizer>,
        options: SpeechInputOptions,
        session: watch::Receiver<AssistantState>,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (events_tx, events) = mpsc::channel(EVENT_BUFFER);
        let supervisor = tokio::spawn(supervise(recognizer, options, session, stop_rx, events_tx));
        Self {
            events,
            control: SpeechInputControl {
                stop: Arc::new(stop_tx),
            },
            supervisor,
        }
    }

    pub fn control(&self) -> SpeechInputControl {
        self.control.clone()
    }

    pub fn stop(&self) {
        self.control.stop();
    }
}

impl Stream for SpeechInputStream {
    type Item = SpeechEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

impl Drop for SpeechInputStream {
    fn drop(&mut self) {
        self.control.stop();
        self.supervisor.abort();
    }
}

enum SessionEnd {
    Natural,
    StartFailed,
    Fatal,
    Stopped,
    ConsumerGone,
}

async fn supervise(
    recognizer: Arc<dyn Recognizer>,
    options: SpeechInputOptions,
    mut session: watch::Receiver<AssistantState>,
    mut stop: watch::Receiver<bool>,
    events: mpsc::Sender<SpeechEvent>,
) {
    if !recognizer.is_available() {
        error!("SpeechInput: no recognition capability on this host");
        let _ = events.send(SpeechEvent::Error(InputFailure::Unavailable)).await;
        return;
    }

    let mut start_failures: u32 = 0;
    loop {
        if *stop.borrow() {
            break;
        }
        if *session.borrow() == AssistantState::Error {
            debug!("SpeechInput: holding restart while session is in ERROR");
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                res = session.wait_for(|s| *s != AssistantState::Error) => {
                    if res.is_err() {
                        break;
                    }
                    continue;
                }
            }
        }

        let end = match recognizer.start(&options.language).await {
            Ok(results) => {
                start_failures = 0;
                debug!(language = %options.language, "SpeechInput: recognition session started");
                pump(results, &mut stop, &events).await
            }
            Err(e) => {
                start_failures = start_failures.saturating_add(1);
                if start_failures == 1 {
                    warn!(error = %e, "SpeechInput: failed to start recognition");
                } else {
                    debug!(error = %e, attempt = start_failures, "SpeechInput: start failed again");
                }
                SessionEnd::StartFailed
            }
        };

        match end {
            SessionEnd::Stopped | SessionEnd::ConsumerGone => break,
            SessionEnd::Fatal => {
                // Wait for the controller to record the ERROR before checking again.
                let _ = tokio::time::timeout(
                    options.restart_delay.max(Duration::from_millis(50)) * 10,
                    session.wait_for(|s| *s == AssistantState::Error),
                )
                .await;
            }
            SessionEnd::Natural => {
                debug!(delay = ?options.restart_delay, "SpeechInput: session ended, restarting");
                tokio::select! {
                    _ = tokio::time::sleep(options.restart_delay) => {}
                    _ = stop.changed() => {}
                }
            }
            SessionEnd::StartFailed => {
                let delay = restart_backoff(options.restart_delay, start_failures);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stop.changed() => {}
                }
            }
        }
    }
    info!("SpeechInput: stopped");
}

/// Doubles `base` per consecutive failure, capped at [`MAX_RESTART_BACKOFF`].
fn restart_backoff(base: Duration, failures: u32) -> Duration {
    base.saturating_mul(1u32 << failures.min(16)).min(MAX_RESTART_BACKOFF)
}

async fn pump(
    mut results: mpsc::Receiver<RawRecognition>,
    stop: &mut watch::Receiver<bool>,
    events: &mpsc::Sender<SpeechEvent>,
) -> SessionEnd {
    loop {
        let item = tokio::select! {
            biased;
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    return SessionEnd::Stopped;
                }
                continue;
            }
            item = results.recv() => item,
        };

        let event = match item {
            None => return SessionEnd::Natural,
            Some(RawRecognition::Interim(text)) => SpeechEvent::Interim(text),
            Some(RawRecognition::Final(text)) => SpeechEvent::Final(text),
            Some(RawRecognition::Error(code)) if code.is_fatal() => {
                error!(?code, "SpeechInput: microphone permission denied");
                let _ = events.send(SpeechEvent::Error(InputFailure::PermissionDenied)).await;
                return SessionEnd::Fatal;
            }
            Some(RawRecognition::Error(code)) if code.is_transient() => {
                debug!(?code, "SpeechInput: transient recognition error");
                continue;
            }
            Some(RawRecognition::Error(code)) => {
                warn!(?code, "SpeechInput: recognition error ignored");
                continue;
            }
        };

        if events.send(event).await.is_err() {
            return SessionEnd::ConsumerGone;
        }
    }
}
