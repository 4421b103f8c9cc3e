//! Configuration loading and defaults.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Top-level Rusty Voice configuration.
///
/// Every section has defaults, so an empty file (or no file) is a valid config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub models: ModelsConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub transcription: TranscriptionConfig,

    #[serde(default)]
    pub tts: TtsConfig,

    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub barge_in: BargeInConfig,

    #[serde(default)]
    pub budget: BudgetConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

// --- Language model providers ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Providers in priority order. More than one enables failover.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

/// Configuration for a single LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// "openai", "openrouter", "ollama" or "anthropic".
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

impl ProviderConfig {
    /// Resolve the API key: check `api_key` field first, then `api_key_env` environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

// --- Conversation engine ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Persona prompt replacing the built-in one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Model override; defaults to the first provider's `default_model`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    /// Number of recent turns included in the prompt.
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,

    /// Ceiling on opening the stream and on each wait for the next fragment.
    #[serde(default = "default_first_fragment_timeout_ms")]
    pub first_fragment_timeout_ms: u64,

    /// Delay before the single generation retry.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_clarification_text")]
    pub clarification_text: String,

    #[serde(default = "default_unavailable_text")]
    pub unavailable_text: String,
}

fn default_max_tokens() -> u32 {
    512
}

fn default_history_turns() -> usize {
    12
}

fn default_first_fragment_timeout_ms() -> u64 {
    10_000
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_clarification_text() -> String {
    "Sorry, I didn't quite catch that. Could you say it again?".into()
}

fn default_unavailable_text() -> String {
    "I'm temporarily unavailable. Please try again in a moment.".into()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: None,
            model: None,
            max_tokens: default_max_tokens(),
            temperature: None,
            history_turns: default_history_turns(),
            first_fragment_timeout_ms: default_first_fragment_timeout_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            clarification_text: default_clarification_text(),
            unavailable_text: default_unavailable_text(),
        }
    }
}

// --- Speech-to-text ---

/// Streaming transcription configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    /// Provider: "deepgram" (streaming), "groq" or "openai" (batch Whisper with local VAD).
    #[serde(default = "default_transcription_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Model name (e.g. "nova-2", "whisper-large-v3-turbo").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Silence window after which an utterance is considered complete.
    #[serde(default = "default_utterance_end_ms")]
    pub utterance_end_ms: u64,

    /// Final transcripts below this confidence get a clarification reply.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,

    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,

    /// RMS threshold for the local VAD used by batch providers.
    #[serde(default = "default_vad_threshold")]
    pub vad_threshold: f64,

    /// Longest utterance a batch provider buffers before uploading it anyway.
    #[serde(default = "default_max_utterance_ms")]
    pub max_utterance_ms: u64,
}

fn default_transcription_provider() -> String {
    "deepgram".into()
}

fn default_sample_rate() -> u32 {
    16_000
}

fn default_utterance_end_ms() -> u64 {
    1000
}

fn default_confidence_threshold() -> f32 {
    0.5
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_base_ms() -> u64 {
    250
}

fn default_vad_threshold() -> f64 {
    300.0
}

fn default_max_utterance_ms() -> u64 {
    30_000
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            provider: default_transcription_provider(),
            api_key: None,
            api_key_env: None,
            model: None,
            language: None,
            base_url: None,
            sample_rate: default_sample_rate(),
            utterance_end_ms: default_utterance_end_ms(),
            confidence_threshold: default_confidence_threshold(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_ms: default_reconnect_base_ms(),
            vad_threshold: default_vad_threshold(),
            max_utterance_ms: default_max_utterance_ms(),
        }
    }
}

impl TranscriptionConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

// --- Text-to-speech ---

/// Text-to-speech (TTS) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    /// TTS provider (default: "elevenlabs").
    #[serde(default = "default_tts_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Default voice ID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_voice: Option<String>,

    /// Default model ID (e.g. "eleven_turbo_v2").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,

    /// Output format (default: "mp3_22050_32").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_format: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// A speakable unit is flushed at sentence punctuation once this many chars accumulate.
    #[serde(default = "default_min_batch_chars")]
    pub min_batch_chars: usize,

    /// Hard cap; longer buffers are split at the last whitespace.
    #[serde(default = "default_max_batch_chars")]
    pub max_batch_chars: usize,
}

fn default_tts_provider() -> String {
    "elevenlabs".into()
}

fn default_min_batch_chars() -> usize {
    24
}

fn default_max_batch_chars() -> usize {
    200
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            provider: default_tts_provider(),
            api_key: None,
            api_key_env: None,
            default_voice: None,
            default_model: None,
            output_format: None,
            base_url: None,
            min_batch_chars: default_min_batch_chars(),
            max_batch_chars: default_max_batch_chars(),
        }
    }
}

impl TtsConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

// --- Capture, barge-in, budget, memory ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_frame_ms")]
    pub frame_ms: u32,

    /// Capacity of the frame queue; the oldest frame is dropped when full.
    #[serde(default = "default_queue_frames")]
    pub queue_frames: usize,
}

fn default_frame_ms() -> u32 {
    20
}

fn default_queue_frames() -> usize {
    50
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            frame_ms: default_frame_ms(),
            queue_frames: default_queue_frames(),
        }
    }
}

impl CaptureConfig {
    /// Bytes per frame for 16-bit mono audio at `sample_rate`.
    pub fn frame_bytes(&self, sample_rate: u32) -> usize {
        (sample_rate as usize * self.frame_ms as usize / 1000).max(1) * 2
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BargeInConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// 0 = interrupt on `SpeechStarted` immediately. Otherwise the interruption
    /// is confirmed only if a non-empty transcript arrives within this window.
    #[serde(default)]
    pub debounce_ms: u64,
}

fn default_true() -> bool {
    true
}

impl Default for BargeInConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Maximum assistant turns per session (unlimited when unset).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_turns_per_session: Option<u32>,

    /// Maximum provider-reported tokens per session (unlimited when unset).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens_per_session: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Fact store location (default: `~/.rusty_voice/memory.json`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Maximum facts returned per lookup.
    #[serde(default = "default_lookup_limit")]
    pub lookup_limit: usize,

    /// Store each completed exchange back into memory.
    #[serde(default)]
    pub write_back: bool,

    /// Maximum stored facts (0 = unlimited).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_entries: Option<usize>,
}

fn default_lookup_limit() -> usize {
    2
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            lookup_limit: default_lookup_limit(),
            write_back: false,
            max_entries: None,
        }
    }
}

// --- Gateway and logging ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<GatewayAuthConfig>,
}

fn default_port() -> u16 {
    18790
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayAuthConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,
}

impl GatewayAuthConfig {
    /// Resolve the auth token from direct value or env var.
    pub fn resolve_token(&self) -> Option<String> {
        resolve_secret_field(&self.token, &self.token_env)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "rusty_voice_media=debug").
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

static ENV_VAR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("env var pattern is valid"));

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    ENV_VAR_PATTERN
        .replace_all(input, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_default()
        })
        .into_owned()
}

/// Base data directory: `~/.rusty_voice`.
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".rusty_voice")
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

    /// Parse config text (JSON5 with `${ENV_VAR}` references).
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let substituted = substitute_env_vars(raw);
        json5::from_str(&substituted)
            .map_err(|e| crate::error::VoiceError::Config(e.to_string()))
    }

    /// Default config file path.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    /// Gateway port.
    pub fn gateway_port(&self) -> u16 {
        self.gateway
            .as_ref()
            .map(|g| g.port)
            .unwrap_or_else(default_port)
    }

    /// Gateway bind address.
    pub fn gateway_bind(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "127.0.0.1".to_string())
    }

    /// The gateway auth token, if auth is configured.
    pub fn gateway_token(&self) -> Option<String> {
        self.gateway
            .as_ref()
            .and_then(|g| g.auth.as_ref())
            .and_then(GatewayAuthConfig::resolve_token)
    }

    /// Model for generation: explicit agent override, else the first provider's default.
    pub fn model(&self) -> String {
        self.agent
            .model
            .clone()
            .or_else(|| {
                self.models
                    .providers
                    .first()
                    .and_then(|p| p.default_model.clone())
            })
            .unwrap_or_else(|| "gpt-4o-mini".to_string())
    }

    /// Resolved memory store path.
    pub fn memory_path(&self) -> PathBuf {
        self.memory
            .path
            .as_ref()
            .map(|p| PathBuf::from(shellexpand::tilde(p).as_ref()))
            .unwrap_or_else(|| data_dir().join("memory.json"))
    }

    /// Bytes per capture frame.
    pub fn frame_bytes(&self) -> usize {
        self.capture.frame_bytes(self.transcription.sample_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_defaults() {
        let config = Config::parse("{}").unwrap();
        assert_eq!(config.transcription.provider, "deepgram");
        assert_eq!(config.transcription.sample_rate, 16_000);
        assert_eq!(config.transcription.utterance_end_ms, 1000);
        assert_eq!(config.transcription.max_utterance_ms, 30_000);
        assert!((config.transcription.confidence_threshold - 0.5).abs() < f32::EPSILON);
        assert_eq!(config.agent.history_turns, 12);
        assert_eq!(config.agent.first_fragment_timeout_ms, 10_000);
        assert_eq!(config.memory.lookup_limit, 2);
        assert!(config.barge_in.enabled);
        assert_eq!(config.barge_in.debounce_ms, 0);
        assert_eq!(config.gateway_port(), 18790);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("nope.json")).unwrap();
        assert!(config.models.providers.is_empty());
    }

    #[test]
    fn test_json5_with_comments_and_partial_sections() {
        let raw = r#"{
            // streaming STT
            transcription: { provider: "groq", utterance_end_ms: 800 },
            barge_in: { debounce_ms: 150 },
            models: { providers: [{ id: "openai", default_model: "gpt-4o" }] },
        }"#;
        let config = Config::parse(raw).unwrap();
        assert_eq!(config.transcription.provider, "groq");
        assert_eq!(config.transcription.utterance_end_ms, 800);
        assert_eq!(config.transcription.max_reconnect_attempts, 5);
        assert_eq!(config.barge_in.debounce_ms, 150);
        assert!(config.barge_in.enabled);
        assert_eq!(config.model(), "gpt-4o");
    }

    #[test]
    fn test_env_substitution() {
        // SAFETY: test-local variable name, no other test reads it.
        unsafe { std::env::set_var("RUSTY_VOICE_TEST_VOICE", "Rachel") };
        let config =
            Config::parse(r#"{ tts: { default_voice: "${RUSTY_VOICE_TEST_VOICE}" } }"#).unwrap();
        assert_eq!(config.tts.default_voice.as_deref(), Some("Rachel"));
    }

    #[test]
    fn test_resolve_secret_prefers_direct_value() {
        let direct = Some("direct".to_string());
        let env = Some("RUSTY_VOICE_UNSET_VAR_FOR_TEST".to_string());
        assert_eq!(resolve_secret_field(&direct, &env).as_deref(), Some("direct"));
        assert_eq!(resolve_secret_field(&Some(String::new()), &env), None);
    }

    #[test]
    fn test_frame_bytes() {
        let config = Config::default();
        assert_eq!(config.frame_bytes(), 640);
    }

    #[test]
    fn test_logging_section() {
        let config = Config::parse(r#"{ logging: { format: "json", level: "debug" } }"#).unwrap();
        let logging = config.logging.expect("logging should be present");
        assert_eq!(logging.format, "json");
        assert_eq!(logging.level.as_deref(), Some("debug"));
        assert_eq!(logging.output, "stderr");
    }

    #[test]
    fn test_invalid_config_is_config_error() {
        let err = Config::parse("{ not json").unwrap_err();
        assert_eq!(err.code(), "config");
    }
}
