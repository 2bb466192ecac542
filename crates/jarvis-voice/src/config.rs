//! **VoiceConfig**: layered configuration for the voice session.
//!
//! Precedence: `JARVIS__*` environment variables > TOML file at `JARVIS_CONFIG`
//! (default `config/jarvis.toml`) > built-in defaults. The API credential is read
//! separately from `GEMINI_API_KEY` / `API_KEY` and kept as a [`SecretString`].

use crate::error::{VoiceError, VoiceResult};
use secrecy::SecretString;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "config/jarvis.toml";

const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are JARVIS. Respond instantly and concisely (max 20 words). \
     Be professional and slightly witty. Use British English.";

/// Top-level configuration. Every section falls back to its defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub wake: WakeConfig,
    pub recognition: RecognitionConfig,
    pub dispatch: DispatchConfig,
    pub synthesis: SynthesisConfig,
    pub fallback: FallbackConfig,
    pub session: SessionConfig,
    #[serde(skip)]
    api_key: Option<Arc<SecretString>>,
}

/// Wake phrase and the timers that send an attentive session back to sleep.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WakeConfig {
    pub phrase: String,
    /// Optional greeting word that may precede the phrase ("hey jarvis").
    pub greeting: Option<String>,
    /// Sleep after a bare wake phrase with no follow-up.
    pub wake_timeout_ms: u64,
    /// Re-armed on fresh speech activity while listening.
    pub activity_timeout_ms: u64,
    /// Sleep after manual activation.
    pub manual_timeout_ms: u64,
    pub greeting_reply: String,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            phrase: "jarvis".to_string(),
            greeting: Some("hey".to_string()),
            wake_timeout_ms: 6_000,
            activity_timeout_ms: 8_000,
            manual_timeout_ms: 15_000,
            greeting_reply: "Yes, user?".to_string(),
        }
    }
}

impl WakeConfig {
    pub fn wake_timeout(&self) -> Duration {
        Duration::from_millis(self.wake_timeout_ms)
    }

    pub fn activity_timeout(&self) -> Duration {
        Duration::from_millis(self.activity_timeout_ms)
    }

    pub fn manual_timeout(&self) -> Duration {
        Duration::from_millis(self.manual_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    pub language: String,
    pub restart_delay_ms: u64,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            language: "en-US".to_string(),
            restart_delay_ms: 100,
        }
    }
}

impl RecognitionConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

/// Text generation: retry policy, history window and model settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub history_window: usize,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    /// How long the ERROR transcript stays up after a failed dispatch.
    pub error_return_ms: u64,
    pub base_url: String,
    pub model: String,
    pub system_instruction: String,
    pub search_grounding: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            history_window: 4,
            max_attempts: 3,
            base_delay_ms: 1_000,
            error_return_ms: 4_000,
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            model: "gemini-3-flash-preview".to_string(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            search_grounding: true,
        }
    }
}

impl DispatchConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn error_return(&self) -> Duration {
        Duration::from_millis(self.error_return_ms)
    }
}

/// Remote speech synthesis and the PCM format it returns.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    /// Remote synthesis is skipped for this long after a quota failure.
    pub quota_cooldown_ms: u64,
    /// How long the ERROR transcript stays up when no output path works.
    pub error_return_ms: u64,
    pub model: String,
    pub voice: String,
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_delay_ms: 300,
            quota_cooldown_ms: 60_000,
            error_return_ms: 5_000,
            model: "gemini-2.5-flash-preview-tts".to_string(),
            voice: "Kore".to_string(),
            sample_rate: crate::audio::PCM_SAMPLE_RATE,
            channels: 1,
        }
    }
}

impl SynthesisConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn quota_cooldown(&self) -> Duration {
        Duration::from_millis(self.quota_cooldown_ms)
    }

    pub fn error_return(&self) -> Duration {
        Duration::from_millis(self.error_return_ms)
    }
}

/// Local, network-free synthesis.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub rate: f32,
    pub pitch: f32,
    /// Checked in order against voice names and languages.
    pub preferred_voices: Vec<String>,
    pub command: String,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            rate: 1.0,
            pitch: 1.0,
            preferred_voices: vec![
                "en-gb".to_string(),
                "male".to_string(),
                "daniel".to_string(),
                "google uk english male".to_string(),
            ],
            command: "espeak-ng".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Spoken instead of dispatching while offline.
    pub offline_reply: String,
    pub storage_path: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            offline_reply: "I am offline at the moment. Local systems only.".to_string(),
            storage_path: "./data/jarvis".to_string(),
        }
    }
}

impl VoiceConfig {
    /// Load from file and environment, then pick up the credential.
    pub fn load() -> VoiceResult<Self> {
        let config_path =
            std::env::var("JARVIS_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let builder = config::Config::builder();

        let path = Path::new(&config_path);
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(
                config::Environment::with_prefix("JARVIS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut loaded: VoiceConfig = built.try_deserialize()?;
        loaded.api_key = env_secret(&["GEMINI_API_KEY", "API_KEY"]);
        loaded.validate()?;
        Ok(loaded)
    }

    /// Attach a credential explicitly (tests, non-env wiring).
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(Arc::new(SecretString::from(key.into())));
        self
    }

    pub fn api_key(&self) -> Option<&SecretString> {
        self.api_key.as_deref()
    }

    pub fn validate(&self) -> VoiceResult<()> {
        if self.wake.phrase.trim().is_empty() {
            return Err(VoiceError::Config("wake.phrase must not be empty".to_string()));
        }
        if self.synthesis.channels == 0 {
            return Err(VoiceError::Config("synthesis.channels must be at least 1".to_string()));
        }
        if self.synthesis.sample_rate == 0 {
            return Err(VoiceError::Config("synthesis.sample_rate must be positive".to_string()));
        }
        if self.dispatch.max_attempts == 0 || self.synthesis.max_attempts == 0 {
            return Err(VoiceError::Config("max_attempts must be at least 1".to_string()));
        }
        Ok(())
    }
}

fn env_secret(keys: &[&str]) -> Option<Arc<SecretString>> {
    keys.iter()
        .filter_map(|k| std::env::var(k).ok())
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
        .map(|v| Arc::new(SecretString::from(v)))
}
