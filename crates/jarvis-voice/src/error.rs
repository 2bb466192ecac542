//! Error types for the JARVIS voice session

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur in the voice session
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Audio decode error: {0}")]
    Decode(String),

    #[error("Audio session is closed")]
    SessionClosed,

    #[error("Speech recognition error: {0}")]
    Recognition(String),

    #[error("Local synthesis error: {0}")]
    LocalSynthesis(String),

    #[error("Collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    #[error("History store error: {0}")]
    Store(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Classified failure of a remote collaborator (text generation or speech synthesis).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("collaborator returned status {code}: {body}")]
    Status { code: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("empty audio payload")]
    EmptyPayload,

    #[error("malformed response: {0}")]
    Decode(String),
}

impl CollaboratorError {
    /// Rate limits, server errors and fetch-level failures are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            CollaboratorError::Status { code, .. } => *code == 429 || *code == 500,
            CollaboratorError::Network(_) => true,
            CollaboratorError::EmptyPayload | CollaboratorError::Decode(_) => false,
        }
    }

    /// True when the remote side reports an exhausted quota.
    pub fn is_quota(&self) -> bool {
        match self {
            CollaboratorError::Status { code, body } => {
                let body = body.to_ascii_lowercase();
                *code == 429 || body.contains("resource_exhausted") || body.contains("quota")
            }
            _ => false,
        }
    }
}

impl From<reqwest::Error> for CollaboratorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            CollaboratorError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            CollaboratorError::Status {
                code: status.as_u16(),
                body: err.to_string(),
            }
        } else {
            CollaboratorError::Network(err.to_string())
        }
    }
}
