//! Streaming TTS: audio bytes are yielded as they arrive from the provider.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tracing::debug;

use rusty_voice_core::config::TtsConfig;

const ELEVENLABS_BASE_URL: &str = "https://api.elevenlabs.io";
/// "Rachel", the ElevenLabs default voice.
const DEFAULT_VOICE_ID: &str = "21m00Tcm4TlvDq8ikWAM";
const DEFAULT_MODEL: &str = "eleven_turbo_v2";
const DEFAULT_OUTPUT_FORMAT: &str = "mp3_22050_32";

pub type AudioByteStream = Pin<Box<dyn Stream<Item = anyhow::Result<Bytes>> + Send>>;

#[async_trait]
pub trait TtsProvider: Send + Sync {
    fn id(&self) -> &str;

    /// Open one streaming synthesis call for a speakable unit.
    async fn synthesize(&self, text: &str) -> anyhow::Result<AudioByteStream>;
}

/// Build the configured synthesis provider.
pub fn build_provider(config: &TtsConfig) -> anyhow::Result<Arc<dyn TtsProvider>> {
    match config.provider.as_str() {
        "elevenlabs" => {
            let api_key = config
                .resolve_api_key()
                .ok_or_else(|| anyhow::anyhow!("No TTS API key configured"))?;
            Ok(Arc::new(ElevenLabsTts::new(api_key, config)))
        }
        other => anyhow::bail!("Unknown TTS provider: {other}"),
    }
}

pub struct ElevenLabsTts {
    api_key: String,
    base_url: String,
    voice: String,
    model: String,
    output_format: String,
    client: reqwest::Client,
}

impl ElevenLabsTts {
    pub fn new(api_key: String, config: &TtsConfig) -> Self {
        Self {
            api_key,
            base_url: config
                .base_url
                .as_deref()
                .unwrap_or(ELEVENLABS_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            voice: config
                .default_voice
                .clone()
                .unwrap_or_else(|| DEFAULT_VOICE_ID.into()),
            model: config
                .default_model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.into()),
            output_format: config
                .output_format
                .clone()
                .unwrap_or_else(|| DEFAULT_OUTPUT_FORMAT.into()),
            client: reqwest::Client::new(),
        }
    }

    /// Streaming endpoint for the configured voice.
    pub fn stream_url(&self) -> String {
        format!(
            "{}/v1/text-to-speech/{}/stream?output_format={}",
            self.base_url, self.voice, self.output_format
        )
    }
}

#[async_trait]
impl TtsProvider for ElevenLabsTts {
    fn id(&self) -> &str {
        "elevenlabs"
    }

    async fn synthesize(&self, text: &str) -> anyhow::Result<AudioByteStream> {
        debug!(voice = %self.voice, model = %self.model, text_len = text.len(), "Starting TTS stream");

        let resp = self
            .client
            .post(self.stream_url())
            .header("xi-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({
                "text": text,
                "model_id": self.model,
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("TTS API error {status}: {body}");
        }

        let stream = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| anyhow::anyhow!("TTS stream error: {e}")));
        Ok(Box::pin(stream))
    }
}
