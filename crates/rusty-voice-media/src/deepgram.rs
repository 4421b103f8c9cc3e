//! Deepgram live transcription over WebSocket.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, trace, warn};

use rusty_voice_core::config::TranscriptionConfig;

use crate::stt::{SttLink, SttProvider, SttProviderEvent};

const DEEPGRAM_URL: &str = "wss://api.deepgram.com/v1/listen";
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

pub struct DeepgramProvider {
    api_key: String,
    base_url: String,
    model: String,
    language: Option<String>,
    sample_rate: u32,
    utterance_end_ms: u64,
}

impl DeepgramProvider {
    pub fn new(api_key: String, config: &TranscriptionConfig) -> Self {
        Self {
            api_key,
            base_url: config
                .base_url
                .as_deref()
                .unwrap_or(DEEPGRAM_URL)
                .trim_end_matches('/')
                .to_string(),
            model: config.model.clone().unwrap_or_else(|| "nova-2".into()),
            language: config.language.clone(),
            sample_rate: config.sample_rate,
            utterance_end_ms: config.utterance_end_ms,
        }
    }

    /// The listen URL with streaming parameters.
    pub fn listen_url(&self) -> String {
        let mut url = format!(
            "{}?model={}&encoding=linear16&sample_rate={}&channels=1\
             &interim_results=true&utterance_end_ms={}&vad_events=true&punctuate=true",
            self.base_url, self.model, self.sample_rate, self.utterance_end_ms
        );
        if let Some(language) = &self.language {
            url.push_str("&language=");
            url.push_str(language);
        }
        url
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum DeepgramMessage {
    Results {
        channel: ResultsChannel,
        #[serde(default)]
        is_final: bool,
    },
    SpeechStarted {},
    UtteranceEnd {},
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ResultsChannel {
    #[serde(default)]
    alternatives: Vec<Alternative>,
}

#[derive(Debug, Deserialize)]
struct Alternative {
    #[serde(default)]
    transcript: String,
    #[serde(default)]
    confidence: f32,
}

/// Map one JSON text message from the service to a provider event.
pub fn parse_message(text: &str) -> Option<SttProviderEvent> {
    let message: DeepgramMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            trace!(%e, "Unparsed Deepgram message");
            return None;
        }
    };
    match message {
        DeepgramMessage::Results { channel, is_final } => {
            let alt = channel.alternatives.into_iter().next()?;
            Some(SttProviderEvent::Transcript {
                text: alt.transcript,
                is_final,
                confidence: alt.confidence.clamp(0.0, 1.0),
            })
        }
        DeepgramMessage::SpeechStarted {} => Some(SttProviderEvent::SpeechStarted),
        DeepgramMessage::UtteranceEnd {} => Some(SttProviderEvent::UtteranceEnd),
        DeepgramMessage::Other => None,
    }
}

#[async_trait]
impl SttProvider for DeepgramProvider {
    fn id(&self) -> &str {
        "deepgram"
    }

    async fn connect(&self) -> anyhow::Result<SttLink> {
        let mut request = self.listen_url().into_client_request()?;
        request.headers_mut().insert(
            "Authorization",
            HeaderValue::from_str(&format!("Token {}", self.api_key))?,
        );

        let (ws, _) = connect_async(request).await?;
        debug!(model = %self.model, sample_rate = self.sample_rate, "Deepgram connected");
        let (mut ws_tx, ws_rx) = ws.split();

        let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(64);

        tokio::spawn(async move {
            let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
            keepalive.tick().await;
            loop {
                tokio::select! {
                    pcm = audio_rx.recv() => match pcm {
                        Some(pcm) => {
                            keepalive.reset();
                            if ws_tx.send(Message::Binary(pcm.into())).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            let _ = ws_tx
                                .send(Message::Text(r#"{"type":"CloseStream"}"#.into()))
                                .await;
                            break;
                        }
                    },
                    _ = keepalive.tick() => {
                        if ws_tx.send(Message::Text(r#"{"type":"KeepAlive"}"#.into())).await.is_err() {
                            break;
                        }
                    }
                }
            }
            trace!("Deepgram writer finished");
        });

        let events = ws_rx
            .filter_map(|message| async move {
                match message {
                    Ok(Message::Text(text)) => parse_message(text.as_str()).map(Ok),
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "Deepgram closed the stream");
                        None
                    }
                    Ok(_) => None,
                    Err(e) => {
                        warn!(%e, "Deepgram socket error");
                        Some(Err(anyhow::anyhow!("Deepgram socket error: {e}")))
                    }
                }
            })
            .boxed();

        Ok(SttLink {
            audio: audio_tx,
            events,
        })
    }
}
