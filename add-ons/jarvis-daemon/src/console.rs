//! Terminal stand-in for a host speech recognizer: each stdin line is one
//! recognition result delivered into the live session.

use async_trait::async_trait;
use jarvis_voice::{RawRecognition, RecognitionErrorCode, Recognizer, VoiceResult};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

const SESSION_BUFFER: usize = 16;

#[derive(Clone, Default)]
pub struct ConsoleRecognizer {
    session: Arc<Mutex<Option<mpsc::Sender<RawRecognition>>>>,
}

impl ConsoleRecognizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Turn a typed line into a recognition result.
    /// `~text` is interim, `!code` a recognition error, anything else final.
    pub fn parse(line: &str) -> Option<RawRecognition> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        if let Some(interim) = line.strip_prefix('~') {
            return Some(RawRecognition::Interim(interim.trim().to_string()));
        }
        if let Some(code) = line.strip_prefix('!') {
            return Some(RawRecognition::Error(RecognitionErrorCode::parse(code.trim())));
        }
        Some(RawRecognition::Final(line.to_string()))
    }

    /// Deliver into the current session. False when no session is listening.
    pub fn feed(&self, item: RawRecognition) -> bool {
        let guard = match self.session.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match guard.as_ref() {
            Some(tx) => tx.try_send(item).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl Recognizer for ConsoleRecognizer {
    async fn start(&self, language: &str) -> VoiceResult<mpsc::Receiver<RawRecognition>> {
        let (tx, rx) = mpsc::channel(SESSION_BUFFER);
        let mut guard = match self.session.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(tx);
        debug!(language, "console recognition session opened");
        Ok(rx)
    }
}
