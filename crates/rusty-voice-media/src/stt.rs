//! Speech-to-text provider seam.
//!
//! A provider connection is an [`SttLink`]: PCM goes in through a channel and
//! vendor callbacks come back out as a stream of [`SttProviderEvent`]s. The
//! stream ending (or yielding an error) means the link dropped.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::mpsc;

use rusty_voice_core::config::{CaptureConfig, TranscriptionConfig};

use crate::deepgram::DeepgramProvider;
use crate::whisper::WhisperBatchProvider;

/// An event reported by the speech-to-text service.
#[derive(Debug, Clone, PartialEq)]
pub enum SttProviderEvent {
    Transcript {
        text: String,
        is_final: bool,
        confidence: f32,
    },
    /// Voice onset. Fires regardless of transcript finality.
    SpeechStarted,
    /// The silence window elapsed after speech.
    UtteranceEnd,
}

pub type SttEventStream = Pin<Box<dyn Stream<Item = anyhow::Result<SttProviderEvent>> + Send>>;

/// One live provider connection.
pub struct SttLink {
    /// Raw 16-bit mono PCM. Dropping the sender asks the provider to flush and close.
    pub audio: mpsc::Sender<Vec<u8>>,
    pub events: SttEventStream,
}

#[async_trait]
pub trait SttProvider: Send + Sync {
    /// Provider identifier (e.g. "deepgram").
    fn id(&self) -> &str;

    /// Open a new link. Called again after every drop.
    async fn connect(&self) -> anyhow::Result<SttLink>;
}

/// Build the configured speech-to-text provider.
pub fn build_provider(
    config: &TranscriptionConfig,
    capture: &CaptureConfig,
) -> anyhow::Result<Arc<dyn SttProvider>> {
    let api_key = config
        .resolve_api_key()
        .ok_or_else(|| anyhow::anyhow!("No transcription API key configured"))?;

    let provider: Arc<dyn SttProvider> = match config.provider.as_str() {
        "deepgram" => Arc::new(DeepgramProvider::new(api_key, config)),
        "groq" | "openai" => Arc::new(WhisperBatchProvider::new(api_key, config, capture.frame_ms)),
        other => anyhow::bail!("Unknown transcription provider: {other}"),
    };
    Ok(provider)
}
