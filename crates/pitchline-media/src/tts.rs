//! Text-to-speech for prospect replies.

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use pitchline_core::config::TtsConfig;

const DEFAULT_BASE_URL: &str = "https://api.deepgram.com";

/// Turns reply text into encoded audio (MP3).
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> anyhow::Result<Bytes>;
}

/// Deepgram Aura voices via `POST /v1/speak`.
pub struct DeepgramTts {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl DeepgramTts {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, base_url: Option<&str>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &TtsConfig) -> anyhow::Result<Self> {
        let api_key = config
            .resolve_api_key()
            .ok_or_else(|| anyhow::anyhow!("No TTS API key configured"))?;
        Ok(Self::new(api_key, config.model.clone(), config.base_url.as_deref()))
    }

    fn speak_url(&self) -> String {
        format!("{}/v1/speak?model={}", self.base_url, self.model)
    }
}

#[async_trait]
impl SpeechSynthesizer for DeepgramTts {
    async fn synthesize(&self, text: &str) -> anyhow::Result<Bytes> {
        debug!(model = %self.model, text_len = text.len(), "Requesting speech");

        let resp = self
            .client
            .post(self.speak_url())
            .header("Authorization", format!("Token {}", self.api_key))
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("TTS API error {status}: {body}");
        }

        let audio = resp.bytes().await?;
        if audio.is_empty() {
            anyhow::bail!("TTS API returned no audio");
        }
        debug!(bytes = audio.len(), "Speech ready");
        Ok(audio)
    }
}
