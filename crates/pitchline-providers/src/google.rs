//! Google Generative AI (Gemini) provider.
//!
//! Uses the non-streaming `generateContent` endpoint; replies are short
//! spoken lines, so the whole text is needed before synthesis anyway.
//! Auth is via API key in query parameter.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, trace};

use pitchline_core::config::LlmConfig;

use crate::prompts;
use crate::{CallContext, CallCoach, CallScore, ReplyGenerator, ReplyRequest};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

pub struct GeminiProvider {
    pub base_url: String,
    model: String,
    api_key: String,
    max_tokens: Option<u32>,
    temperature: Option<f64>,
    client: reqwest::Client,
}

impl GeminiProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, base_url: Option<&str>) -> Self {
        Self {
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            model: model.into(),
            api_key: api_key.into(),
            max_tokens: None,
            temperature: None,
            client: reqwest::Client::new(),
        }
    }

    /// Build from config, failing when no API key can be resolved.
    pub fn from_config(config: &LlmConfig) -> anyhow::Result<Self> {
        let api_key = config
            .resolve_api_key()
            .ok_or_else(|| anyhow::anyhow!("No LLM API key configured"))?;
        let mut provider = Self::new(api_key, config.model.clone(), config.base_url.as_deref());
        provider.max_tokens = config.max_tokens;
        provider.temperature = config.temperature;
        Ok(provider)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Run a single-turn generation and return the concatenated text parts.
    pub async fn generate(&self, system: Option<&str>, prompt: &str) -> anyhow::Result<String> {
        let body = GeminiRequest {
            contents: vec![json!({ "role": "user", "parts": [{ "text": prompt }] })],
            system_instruction: system.map(|s| json!({ "parts": [{ "text": s }] })),
            generation_config: Some(GenerationConfig {
                max_output_tokens: self.max_tokens,
                temperature: self.temperature,
            }),
        };

        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );

        debug!(model = %self.model, prompt_len = prompt.len(), "Calling Gemini API");

        let response = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Gemini API error {status}: {body}");
        }

        let parsed: GeminiResponse = response.json().await?;
        let text = parsed.text();
        trace!(text_len = text.len(), "Gemini response");

        if text.trim().is_empty() {
            let reason = parsed
                .candidates
                .first()
                .and_then(|c| c.finish_reason.clone())
                .unwrap_or_else(|| "no candidates".into());
            anyhow::bail!("Gemini returned no text ({reason})");
        }

        Ok(text.trim().to_string())
    }
}

// --- Gemini request/response types ---

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: Option<String>,
}

impl GeminiResponse {
    /// Text of the first candidate.
    fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|content| {
                content
                    .parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect::<String>()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl ReplyGenerator for GeminiProvider {
    async fn reply(&self, request: &ReplyRequest) -> anyhow::Result<String> {
        let system = prompts::prospect_system(&request.persona, &request.offer);
        self.generate(Some(&system), &prompts::prospect_turn(request))
            .await
    }
}

#[async_trait]
impl CallCoach for GeminiProvider {
    async fn score(&self, call: &CallContext) -> anyhow::Result<CallScore> {
        let raw = self.generate(None, &prompts::score_prompt(call)).await?;
        Ok(prompts::parse_score(&raw))
    }

    async fn title(&self, call: &CallContext) -> anyhow::Result<String> {
        let raw = self.generate(None, &prompts::title_prompt(call)).await?;
        Ok(prompts::clean_title(&raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gemini_provider_creation() {
        let provider = GeminiProvider::new("key", "gemini-2.0-flash", None);
        assert_eq!(provider.base_url, DEFAULT_BASE_URL);
        assert_eq!(provider.model(), "gemini-2.0-flash");

        let custom = GeminiProvider::new("key", "m", Some("http://localhost:9999/"));
        assert_eq!(custom.base_url, "http://localhost:9999");
    }

    #[test]
    fn test_from_config_requires_key() {
        let config = LlmConfig {
            api_key: None,
            api_key_env: Some("NONEXISTENT_PL_GEMINI_KEY".into()),
            ..LlmConfig::default()
        };
        assert!(GeminiProvider::from_config(&config).is_err());

        let config = LlmConfig {
            api_key: Some("k".into()),
            max_tokens: Some(256),
            ..LlmConfig::default()
        };
        let provider = GeminiProvider::from_config(&config).unwrap();
        assert_eq!(provider.max_tokens, Some(256));
    }

    #[test]
    fn test_request_serialization() {
        let body = GeminiRequest {
            contents: vec![json!({"role": "user", "parts": [{"text": "hi"}]})],
            system_instruction: Some(json!({"parts": [{"text": "sys"}]})),
            generation_config: Some(GenerationConfig {
                max_output_tokens: Some(100),
                temperature: None,
            }),
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["systemInstruction"]["parts"][0]["text"], "sys");
        assert_eq!(value["generationConfig"]["maxOutputTokens"], 100);
        assert!(value["generationConfig"].get("temperature").is_none());
    }

    #[test]
    fn test_response_text_joins_parts() {
        let json = r#"{"candidates":[{"content":{"parts":[{"text":"Who "},{"text":"is this?"}]},"finishReason":"STOP"}]}"#;
        let resp: GeminiResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.text(), "Who is this?");
    }

    #[test]
    fn test_response_without_candidates() {
        let resp: GeminiResponse = serde_json::from_str(r#"{"promptFeedback":{}}"#).unwrap();
        assert_eq!(resp.text(), "");
    }
}
