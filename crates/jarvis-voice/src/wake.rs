//! Wake-phrase matching over lowercased final transcripts.

use crate::error::{VoiceError, VoiceResult};
use regex::Regex;

/// Case-insensitive matcher for the wake phrase and its optional greeting form.
#[derive(Debug, Clone)]
pub struct WakeMatcher {
    phrase: String,
    greeting: Option<String>,
    leading: Regex,
}

impl WakeMatcher {
    pub fn new(phrase: &str, greeting: Option<&str>) -> VoiceResult<Self> {
        let phrase = phrase.trim().to_lowercase();
        if phrase.is_empty() {
            return Err(VoiceError::Config("wake phrase must not be empty".to_string()));
        }
        let greeting = greeting
            .map(|g| g.trim().to_lowercase())
            .filter(|g| !g.is_empty());

        let prefix = greeting
            .as_deref()
            .map(|g| format!(r"(?:{}\s+)?", regex::escape(g)))
            .unwrap_or_default();
        let pattern = format!(r"(?i)^{}{}[,?\s]*", prefix, regex::escape(&phrase));
        let leading = Regex::new(&pattern).map_err(|e| VoiceError::Config(e.to_string()))?;

        Ok(Self {
            phrase,
            greeting,
            leading,
        })
    }

    pub fn phrase(&self) -> &str {
        &self.phrase
    }

    /// True when the phrase (or "greeting phrase") occurs anywhere in `text`.
    pub fn contains(&self, text: &str) -> bool {
        let text = text.to_lowercase();
        if text.contains(&self.phrase) {
            return true;
        }
        match &self.greeting {
            Some(g) => text.contains(&format!("{} {}", g, self.phrase)),
            None => false,
        }
    }

    /// Everything after the first occurrence of the phrase, with leading
    /// punctuation and whitespace removed. `None` if the phrase is absent.
    pub fn trailing_command(&self, text: &str) -> Option<String> {
        let lower = text.to_lowercase();
        let at = lower.find(&self.phrase)?;
        let rest = &lower[at + self.phrase.len()..];
        let rest = rest.trim_start_matches(|c: char| c.is_whitespace() || ",.?!:;".contains(c));
        Some(rest.trim_end().to_string())
    }

    /// Drop a repeated leading wake phrase ("hey jarvis, ...") from a command.
    pub fn strip_leading(&self, text: &str) -> String {
        self.leading.replace(text.trim(), "").trim().to_string()
    }
}
