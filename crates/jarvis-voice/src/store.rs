//! History and theme persistence (sled). Loaded at start, written on every change,
//! flushed to disk when the session shuts down.

use crate::error::VoiceResult;
use crate::state::ChatMessage;
use sled::Db;
use std::path::Path;

pub const HISTORY_KEY: &str = "jarvis_history";
pub const THEME_KEY: &str = "jarvis_theme";

pub trait HistoryStore: Send + Sync {
    fn load_history(&self) -> VoiceResult<Vec<ChatMessage>>;
    fn save_history(&self, history: &[ChatMessage]) -> VoiceResult<()>;
    fn load_theme(&self) -> VoiceResult<Option<String>>;
    fn save_theme(&self, theme: &str) -> VoiceResult<()>;

    /// Make earlier writes durable. Blocking; called once at teardown.
    fn flush(&self) -> VoiceResult<()> {
        Ok(())
    }
}

/// Sled-backed store. Single writer: do not share a path between processes.
pub struct SledHistoryStore {
    db: Db,
}

impl SledHistoryStore {
    pub fn open_path<P: AsRef<Path>>(path: P) -> VoiceResult<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }
}

impl HistoryStore for SledHistoryStore {
    fn load_history(&self) -> VoiceResult<Vec<ChatMessage>> {
        match self.db.get(HISTORY_KEY)? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    fn save_history(&self, history: &[ChatMessage]) -> VoiceResult<()> {
        let bytes = serde_json::to_vec(history)?;
        // Runs on the controller loop; durability waits for `flush` at teardown.
        self.db.insert(HISTORY_KEY, bytes)?;
        Ok(())
    }

    fn load_theme(&self) -> VoiceResult<Option<String>> {
        Ok(self
            .db
            .get(THEME_KEY)?
            .map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    fn save_theme(&self, theme: &str) -> VoiceResult<()> {
        self.db.insert(THEME_KEY, theme.as_bytes())?;
        self.db.flush()?;
        Ok(())
    }

    fn flush(&self) -> VoiceResult<()> {
        self.db.flush()?;
        Ok(())
    }
}
