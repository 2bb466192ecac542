//! Gemini REST client: text generation with search grounding and PCM speech synthesis.
//!
//! API key: `GEMINI_API_KEY` (or `API_KEY`) in `.env`, sent as `x-goog-api-key`.

use crate::config::VoiceConfig;
use crate::dispatcher::{GenerationReply, TextGenerator};
use crate::error::{CollaboratorError, VoiceError, VoiceResult};
use crate::state::{ChatMessage, Role};
use crate::voice_output::SpeechSynthesizer;
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::debug;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<serde_json::Value>,
    generation_config: serde_json::Value,
}

#[derive(Serialize)]
struct Content<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a str>,
    parts: Vec<TextPart<'a>>,
}

#[derive(Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

impl<'a> Content<'a> {
    fn text(role: Option<&'a str>, text: &'a str) -> Self {
        Self {
            role,
            parts: vec![TextPart { text }],
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Debug, Default, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Default, Deserialize)]
struct InlineData {
    #[serde(default)]
    data: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroundingMetadata {
    #[serde(default)]
    grounding_chunks: Vec<GroundingChunk>,
}

#[derive(Debug, Default, Deserialize)]
struct GroundingChunk {
    #[serde(default)]
    web: Option<WebChunk>,
}

#[derive(Debug, Default, Deserialize)]
struct WebChunk {
    #[serde(default)]
    uri: Option<String>,
}

impl GenerateResponse {
    fn first_parts(&self) -> &[ResponsePart] {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|c| c.parts.as_slice())
            .unwrap_or(&[])
    }

    fn into_reply(self) -> GenerationReply {
        let text = self
            .first_parts()
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect::<Vec<_>>()
            .join("");
        let sources = self
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.grounding_metadata)
            .map(|g| {
                g.grounding_chunks
                    .into_iter()
                    .filter_map(|chunk| chunk.web.and_then(|w| w.uri))
                    .collect()
            })
            .unwrap_or_default();
        GenerationReply { text, sources }
    }

    fn into_audio(self) -> Result<String, CollaboratorError> {
        self.first_parts()
            .iter()
            .filter_map(|p| p.inline_data.as_ref())
            .map(|d| d.data.trim())
            .find(|d| !d.is_empty())
            .map(str::to_string)
            .ok_or(CollaboratorError::EmptyPayload)
    }
}

/// Gemini-backed text generator and speech synthesizer.
pub struct GeminiClient {
    base_url: String,
    api_key: SecretString,
    text_model: String,
    speech_model: String,
    voice: String,
    system_instruction: String,
    search_grounding: bool,
    client: reqwest::Client,
}

impl GeminiClient {
    /// Build from config. Fails if no credential was supplied.
    pub fn new(config: &VoiceConfig) -> VoiceResult<Self> {
        let api_key = config.api_key().ok_or_else(|| {
            VoiceError::Config("Gemini requires GEMINI_API_KEY or API_KEY".to_string())
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| VoiceError::Config(e.to_string()))?;
        Ok(Self {
            base_url: config.dispatch.base_url.trim_end_matches('/').to_string(),
            api_key: SecretString::from(api_key.expose_secret().to_string()),
            text_model: config.dispatch.model.clone(),
            speech_model: config.synthesis.model.clone(),
            voice: config.synthesis.voice.clone(),
            system_instruction: config.dispatch.system_instruction.clone(),
            search_grounding: config.dispatch.search_grounding,
            client,
        })
    }

    async fn generate_content(
        &self,
        model: &str,
        body: &GenerateRequest<'_>,
    ) -> Result<GenerateResponse, CollaboratorError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, model);
        let res = self
            .client
            .post(&url)
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(body)
            .send()
            .await?;
        if !res.status().is_success() {
            let code = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            return Err(CollaboratorError::Status { code, body });
        }
        res.json::<GenerateResponse>()
            .await
            .map_err(|e| CollaboratorError::Decode(e.to_string()))
    }
}

#[async_trait]
impl TextGenerator for GeminiClient {
    async fn generate(
        &self,
        utterance: &str,
        history: &[ChatMessage],
    ) -> Result<GenerationReply, CollaboratorError> {
        let mut contents: Vec<Content<'_>> = history
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::User => "user",
                    Role::Assistant => "model",
                };
                Content::text(Some(role), &m.content)
            })
            .collect();
        contents.push(Content::text(Some("user"), utterance));

        let tools = if self.search_grounding {
            vec![json!({ "google_search": {} })]
        } else {
            Vec::new()
        };
        let body = GenerateRequest {
            contents,
            system_instruction: Some(Content::text(None, &self.system_instruction)),
            tools,
            generation_config: json!({ "thinkingConfig": { "thinkingBudget": 0 } }),
        };

        debug!(model = %self.text_model, turns = body.contents.len(), "Gemini: generate");
        Ok(self.generate_content(&self.text_model, &body).await?.into_reply())
    }
}

#[async_trait]
impl SpeechSynthesizer for GeminiClient {
    async fn synthesize(&self, text: &str) -> Result<String, CollaboratorError> {
        let body = GenerateRequest {
            contents: vec![Content::text(None, text)],
            system_instruction: None,
            tools: Vec::new(),
            generation_config: json!({
                "responseModalities": ["AUDIO"],
                "speechConfig": {
                    "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": self.voice } }
                }
            }),
        };
        debug!(model = %self.speech_model, chars = text.len(), "Gemini: synthesize");
        self.generate_content(&self.speech_model, &body).await?.into_audio()
    }
}
