//! **CommandDispatcher**: sends one utterance plus recent history to the
//! text-generation collaborator, retrying transient failures.

use crate::config::DispatchConfig;
use crate::error::CollaboratorError;
use crate::retry::{with_retry, RetryPolicy};
use crate::state::ChatMessage;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Spoken when the collaborator answers with no text.
pub const UNSTABLE_LINK_REPLY: &str = "Neural link unstable. Please repeat.";

/// Raw answer from a text generator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationReply {
    pub text: String,
    pub sources: Vec<String>,
}

/// Remote text generation (Gemini in production).
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// `history` is oldest first and already truncated to the dispatch window.
    async fn generate(
        &self,
        utterance: &str,
        history: &[ChatMessage],
    ) -> Result<GenerationReply, CollaboratorError>;
}

/// Cleaned reply handed back to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReply {
    pub text: String,
    pub sources: Vec<String>,
}

pub struct CommandDispatcher {
    generator: Arc<dyn TextGenerator>,
    retry: RetryPolicy,
    history_window: usize,
}

impl CommandDispatcher {
    pub fn new(generator: Arc<dyn TextGenerator>, config: &DispatchConfig) -> Self {
        Self {
            generator,
            retry: RetryPolicy::new(config.max_attempts, config.base_delay()),
            history_window: config.history_window,
        }
    }

    pub async fn dispatch(
        &self,
        utterance: &str,
        history: &[ChatMessage],
    ) -> Result<DispatchReply, CollaboratorError> {
        let start = history.len().saturating_sub(self.history_window);
        let recent = &history[start..];

        let reply = with_retry(
            &self.retry,
            "dispatch",
            |attempt| {
                debug!(attempt, history = recent.len(), "dispatching command");
                self.generator.generate(utterance, recent)
            },
            CollaboratorError::is_transient,
        )
        .await?;

        let text = if reply.text.trim().is_empty() {
            UNSTABLE_LINK_REPLY.to_string()
        } else {
            reply.text
        };
        let sources = dedupe_sources(reply.sources);
        info!(sources = sources.len(), "dispatch complete");
        Ok(DispatchReply { text, sources })
    }
}

/// Drop empty entries and repeats, keeping first-seen order.
fn dedupe_sources(sources: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(sources.len());
    for source in sources {
        let source = source.trim().to_string();
        if !source.is_empty() && !out.contains(&source) {
            out.push(source);
        }
    }
    out
}
