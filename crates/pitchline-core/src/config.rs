//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level Pitchline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub realtime: Option<RealtimeConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcription: Option<TranscriptionConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm: Option<LlmConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts: Option<TtsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    /// Allowed CORS origins. Empty = allow any origin.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_port() -> u16 {
    8000
}

/// How the text handed to reply generation is assembled from finalized fragments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPolicy {
    /// Join every finalized fragment since the last fired turn.
    #[default]
    Accumulate,
    /// Use only the most recent finalized fragment.
    Latest,
}

/// Realtime voice session tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Silence (no new finalized transcript) that completes a user turn.
    #[serde(default = "default_silence_threshold_ms")]
    pub silence_threshold_ms: u64,

    /// Interval at which the event loop re-checks the silence timer.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Max audio frames buffered between the client and the STT stream.
    /// The oldest frame is dropped when full.
    #[serde(default = "default_audio_queue_capacity")]
    pub audio_queue_capacity: usize,

    /// Max outbound messages buffered for a slow client.
    #[serde(default = "default_client_queue_capacity")]
    pub client_queue_capacity: usize,

    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    #[serde(default)]
    pub turn_policy: TurnPolicy,

    /// Send partial transcripts to the client as live captions.
    #[serde(default)]
    pub forward_partials: bool,

    /// How long teardown waits for the STT stream to close cleanly.
    #[serde(default = "default_stt_close_timeout_ms")]
    pub stt_close_timeout_ms: u64,
}

fn default_silence_threshold_ms() -> u64 {
    2500
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_audio_queue_capacity() -> usize {
    256
}

fn default_client_queue_capacity() -> usize {
    64
}

fn default_sample_rate() -> u32 {
    16_000
}

fn default_stt_close_timeout_ms() -> u64 {
    2000
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            silence_threshold_ms: default_silence_threshold_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            audio_queue_capacity: default_audio_queue_capacity(),
            client_queue_capacity: default_client_queue_capacity(),
            sample_rate: default_sample_rate(),
            turn_policy: TurnPolicy::default(),
            forward_partials: false,
            stt_close_timeout_ms: default_stt_close_timeout_ms(),
        }
    }
}

impl RealtimeConfig {
    pub fn silence_threshold(&self) -> Duration {
        Duration::from_millis(self.silence_threshold_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stt_close_timeout(&self) -> Duration {
        Duration::from_millis(self.stt_close_timeout_ms)
    }
}

/// Speech-to-text configuration (streaming and batch).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    /// Provider (default: "assemblyai").
    #[serde(default = "default_transcription_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_transcription_key_env")]
    pub api_key_env: Option<String>,

    /// REST base URL for batch transcription.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// WebSocket URL for streaming transcription (without query string).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realtime_url: Option<String>,

    /// Poll interval while waiting on a batch transcript.
    #[serde(default = "default_transcription_poll_ms")]
    pub poll_interval_ms: u64,
}

fn default_transcription_provider() -> String {
    "assemblyai".into()
}

fn default_transcription_key_env() -> Option<String> {
    Some("ASSEMBLYAI_API_KEY".into())
}

fn default_transcription_poll_ms() -> u64 {
    1000
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            provider: default_transcription_provider(),
            api_key: None,
            api_key_env: default_transcription_key_env(),
            base_url: None,
            realtime_url: None,
            poll_interval_ms: default_transcription_poll_ms(),
        }
    }
}

impl TranscriptionConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

/// Generative text model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider (default: "google").
    #[serde(default = "default_llm_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_llm_key_env")]
    pub api_key_env: Option<String>,

    #[serde(default = "default_llm_model")]
    pub model: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

fn default_llm_provider() -> String {
    "google".into()
}

fn default_llm_key_env() -> Option<String> {
    Some("GEMINI_API_KEY".into())
}

fn default_llm_model() -> String {
    "gemini-2.0-flash".into()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            api_key: None,
            api_key_env: default_llm_key_env(),
            model: default_llm_model(),
            base_url: None,
            max_tokens: None,
            temperature: None,
        }
    }
}

impl LlmConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

/// Text-to-speech configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    /// Provider (default: "deepgram").
    #[serde(default = "default_tts_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_tts_key_env")]
    pub api_key_env: Option<String>,

    /// Voice model (default: "aura-asteria-en").
    #[serde(default = "default_tts_model")]
    pub model: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

fn default_tts_provider() -> String {
    "deepgram".into()
}

fn default_tts_key_env() -> Option<String> {
    Some("DEEPGRAM_API_KEY".into())
}

fn default_tts_model() -> String {
    "aura-asteria-en".into()
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            provider: default_tts_provider(),
            api_key: None,
            api_key_env: default_tts_key_env(),
            model: default_tts_model(),
            base_url: None,
        }
    }
}

impl TtsConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Jsonl,
    Supabase,
}

/// Durable session archive configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Directory for the JSONL archive (default: `~/.pitchline/archive`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,

    /// Supabase project URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_store_key_env")]
    pub api_key_env: Option<String>,

    #[serde(default = "default_store_table")]
    pub table: String,
}

fn default_store_key_env() -> Option<String> {
    Some("SUPABASE_ANON_PUBLIC_KEY".into())
}

fn default_store_table() -> String {
    "sessions".into()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            dir: None,
            url: None,
            api_key: None,
            api_key_env: default_store_key_env(),
            table: default_store_table(),
        }
    }
}

impl StoreConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.dir
            .as_ref()
            .map(|d| PathBuf::from(shellexpand::tilde(d).as_ref()))
            .unwrap_or_else(|| data_dir().join("archive"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "pitchline_media=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            level: None,
            filters: Vec::new(),
            output: default_log_output(),
        }
    }
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> crate::error::Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| crate::error::PitchlineError::Config(e.to_string()))?;
    Ok(re
        .replace_all(input, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned())
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    /// Parse config from JSON5 text.
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let substituted = substitute_env_vars(raw)?;
        json5::from_str(&substituted)
            .map_err(|e| crate::error::PitchlineError::Config(e.to_string()))
    }

    /// Default config file location.
    pub fn default_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn port(&self) -> u16 {
        self.server.as_ref().map(|s| s.port).unwrap_or_else(default_port)
    }

    pub fn bind_addr(&self) -> String {
        self.server
            .as_ref()
            .and_then(|s| s.bind.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    pub fn realtime(&self) -> RealtimeConfig {
        self.realtime.clone().unwrap_or_default()
    }

    pub fn transcription(&self) -> TranscriptionConfig {
        self.transcription.clone().unwrap_or_default()
    }

    pub fn llm(&self) -> LlmConfig {
        self.llm.clone().unwrap_or_default()
    }

    pub fn tts(&self) -> TtsConfig {
        self.tts.clone().unwrap_or_default()
    }

    pub fn store(&self) -> StoreConfig {
        self.store.clone().unwrap_or_default()
    }

    pub fn logging(&self) -> LoggingConfig {
        self.logging.clone().unwrap_or_default()
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if self.transcription().resolve_api_key().is_none() {
            warnings.push("Transcription provider has no API key configured".to_string());
        }
        if self.llm().resolve_api_key().is_none() {
            warnings.push("LLM provider has no API key configured".to_string());
        }
        if self.tts().resolve_api_key().is_none() {
            warnings.push("TTS provider has no API key configured; replies will be text-only".to_string());
        }

        let providers = [
            ("transcription", self.transcription().provider, default_transcription_provider()),
            ("llm", self.llm().provider, default_llm_provider()),
            ("tts", self.tts().provider, default_tts_provider()),
        ];
        for (section, provider, supported) in providers {
            if provider != supported {
                errors.push(format!(
                    "{section}.provider \"{provider}\" is not supported (expected \"{supported}\")"
                ));
            }
        }

        if self.port() == 0 {
            errors.push("Server port cannot be 0".to_string());
        }

        let rt = self.realtime();
        if rt.silence_threshold_ms == 0 {
            errors.push("realtime.silence_threshold_ms must be greater than 0".to_string());
        }
        if rt.poll_interval_ms == 0 {
            errors.push("realtime.poll_interval_ms must be greater than 0".to_string());
        } else if rt.poll_interval_ms >= rt.silence_threshold_ms {
            errors.push(format!(
                "realtime.poll_interval_ms ({}) must be shorter than silence_threshold_ms ({})",
                rt.poll_interval_ms, rt.silence_threshold_ms
            ));
        }
        if rt.audio_queue_capacity == 0 {
            errors.push("realtime.audio_queue_capacity must be greater than 0".to_string());
        }
        if rt.client_queue_capacity == 0 {
            errors.push("realtime.client_queue_capacity must be greater than 0".to_string());
        }

        let store = self.store();
        if store.backend == StoreBackend::Supabase {
            if store.url.as_deref().is_none_or(str::is_empty) {
                errors.push("store.url is required for the supabase backend".to_string());
            }
            if store.resolve_api_key().is_none() {
                warnings.push("Supabase store has no API key configured".to_string());
            }
        }

        (warnings, errors)
    }
}

/// Base directory for Pitchline data: `~/.pitchline/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".pitchline")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        // SAFETY: test-only, unique variable name
        unsafe { std::env::set_var("TEST_PL_KEY", "sk-test-123") };
        let input = r#"{"key": "${TEST_PL_KEY}", "other": "plain"}"#;
        let result = substitute_env_vars(input).unwrap();
        assert!(result.contains("sk-test-123"));
        assert!(result.contains("plain"));
        unsafe { std::env::remove_var("TEST_PL_KEY") };
    }

    #[test]
    fn test_env_var_missing() {
        let input = r#"{"key": "${NONEXISTENT_VAR_PL_TEST}"}"#;
        let result = substitute_env_vars(input).unwrap();
        assert!(result.contains(r#""""#));
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port(), 8000);
        let rt = config.realtime();
        assert_eq!(rt.silence_threshold(), Duration::from_millis(2500));
        assert_eq!(rt.poll_interval(), Duration::from_millis(100));
        assert_eq!(rt.turn_policy, TurnPolicy::Accumulate);
        assert_eq!(config.llm().model, "gemini-2.0-flash");
        assert_eq!(config.tts().model, "aura-asteria-en");
        assert_eq!(config.store().backend, StoreBackend::Jsonl);
    }

    #[test]
    fn test_partial_realtime_section_uses_defaults() {
        let config = Config::parse(r#"{ realtime: { silence_threshold_ms: 1500, turn_policy: "latest" } }"#)
            .unwrap();
        let rt = config.realtime();
        assert_eq!(rt.silence_threshold_ms, 1500);
        assert_eq!(rt.poll_interval_ms, 100);
        assert_eq!(rt.audio_queue_capacity, 256);
        assert_eq!(rt.turn_policy, TurnPolicy::Latest);
    }

    #[test]
    fn test_resolve_api_key_direct_wins() {
        // SAFETY: test-only, unique variable name
        unsafe { std::env::set_var("TEST_PL_LLM_KEY", "from-env") };
        let mut llm = LlmConfig {
            api_key_env: Some("TEST_PL_LLM_KEY".into()),
            ..LlmConfig::default()
        };
        assert_eq!(llm.resolve_api_key(), Some("from-env".into()));

        llm.api_key = Some("direct-key".into());
        assert_eq!(llm.resolve_api_key(), Some("direct-key".into()));
        unsafe { std::env::remove_var("TEST_PL_LLM_KEY") };
    }

    #[test]
    fn test_logging_config_defaults() {
        let config = Config::parse(r#"{ "logging": {} }"#).unwrap();
        let logging = config.logging.expect("logging should be present");
        assert_eq!(logging.format, "plain");
        assert!(logging.level.is_none());
        assert_eq!(logging.output, "stderr");
        assert!(logging.filters.is_empty());
    }

    #[test]
    fn test_validate_poll_interval_must_be_shorter_than_threshold() {
        let config = Config {
            realtime: Some(RealtimeConfig {
                silence_threshold_ms: 100,
                poll_interval_ms: 200,
                ..RealtimeConfig::default()
            }),
            ..Config::default()
        };
        let (_warnings, errors) = config.validate();
        assert!(
            errors.iter().any(|e| e.contains("poll_interval_ms")),
            "Expected a poll interval error, got: {errors:?}"
        );
    }

    #[test]
    fn test_validate_supabase_requires_url() {
        let config = Config {
            store: Some(StoreConfig {
                backend: StoreBackend::Supabase,
                ..StoreConfig::default()
            }),
            ..Config::default()
        };
        let (_warnings, errors) = config.validate();
        assert!(errors.iter().any(|e| e.contains("store.url")));
    }

    #[test]
    fn test_validate_rejects_unknown_provider() {
        let config = Config::parse(r#"{ tts: { provider: "elevenlabs" }, llm: { provider: "google" } }"#)
            .unwrap();
        let (_warnings, errors) = config.validate();
        assert_eq!(errors.len(), 1, "unexpected errors: {errors:?}");
        assert!(errors[0].contains("tts.provider \"elevenlabs\""));
    }

    #[test]
    fn test_validate_defaults_have_no_errors() {
        let (_warnings, errors) = Config::default().validate();
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    }
}
