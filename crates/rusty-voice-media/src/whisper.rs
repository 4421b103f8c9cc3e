//! Batch Whisper transcription (Groq, OpenAI) behind a local energy VAD.
//!
//! The service only accepts whole files, so a local detector segments the
//! audio: voice onset emits `SpeechStarted`, and after the silence window the
//! buffered utterance is uploaded and reported as a final transcript followed
//! by `UtteranceEnd`.

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use rusty_voice_core::config::TranscriptionConfig;

use crate::stt::{SttLink, SttProvider, SttProviderEvent};
use crate::vad::{VadTransition, VoiceActivityDetector};
use crate::wav::{bytes_to_samples, pcm_to_wav};

/// Utterances shorter than this are treated as noise.
const MIN_UTTERANCE_MS: u64 = 200;

/// Segmented utterances waiting for an upload slot.
const UPLOAD_QUEUE: usize = 4;

pub struct WhisperBatchProvider {
    provider_id: String,
    api_key: String,
    endpoint: String,
    model: String,
    language: Option<String>,
    sample_rate: u32,
    frame_ms: u32,
    utterance_end_ms: u64,
    max_utterance_ms: u64,
    vad_threshold: f64,
    client: reqwest::Client,
}

impl WhisperBatchProvider {
    pub fn new(api_key: String, config: &TranscriptionConfig, frame_ms: u32) -> Self {
        let (default_base, default_model) = match config.provider.as_str() {
            "openai" => ("https://api.openai.com/v1", "whisper-1"),
            _ => ("https://api.groq.com/openai/v1", "whisper-large-v3-turbo"),
        };
        let base = config
            .base_url
            .as_deref()
            .unwrap_or(default_base)
            .trim_end_matches('/');
        Self {
            provider_id: config.provider.clone(),
            api_key,
            endpoint: format!("{base}/audio/transcriptions"),
            model: config.model.clone().unwrap_or_else(|| default_model.into()),
            language: config.language.clone(),
            sample_rate: config.sample_rate,
            frame_ms,
            utterance_end_ms: config.utterance_end_ms,
            max_utterance_ms: config.max_utterance_ms,
            vad_threshold: config.vad_threshold,
            client: reqwest::Client::new(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn upload_job(&self) -> UploadJob {
        UploadJob {
            client: self.client.clone(),
            endpoint: self.endpoint.clone(),
            api_key: self.api_key.clone(),
            model: self.model.clone(),
            language: self.language.clone(),
            sample_rate: self.sample_rate,
        }
    }
}

#[derive(Debug, Deserialize)]
struct VerboseTranscription {
    #[serde(default)]
    text: String,
    #[serde(default)]
    segments: Vec<Segment>,
}

#[derive(Debug, Deserialize)]
struct Segment {
    avg_logprob: f64,
}

/// Confidence from segment log-probabilities: the mean of `exp(avg_logprob)`.
fn confidence_from_segments(segments: &[Segment]) -> f32 {
    if segments.is_empty() {
        return 1.0;
    }
    let sum: f64 = segments.iter().map(|s| s.avg_logprob.exp()).sum();
    ((sum / segments.len() as f64) as f32).clamp(0.0, 1.0)
}

#[derive(Clone)]
struct UploadJob {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    language: Option<String>,
    sample_rate: u32,
}

impl UploadJob {
    async fn transcribe(&self, pcm: &[u8]) -> anyhow::Result<(String, f32)> {
        let wav = pcm_to_wav(pcm, self.sample_rate);
        debug!(endpoint = %self.endpoint, model = %self.model, wav_bytes = wav.len(), "Uploading utterance");

        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")?;
        let mut form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .text("response_format", "verbose_json")
            .part("file", part);
        if let Some(language) = &self.language {
            form = form.text("language", language.clone());
        }

        let resp = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Transcription API error {status}: {body}");
        }

        let result: VerboseTranscription = resp.json().await?;
        Ok((
            result.text.trim().to_string(),
            confidence_from_segments(&result.segments),
        ))
    }
}

/// Segments PCM into utterances with the energy detector.
struct Segmenter {
    vad: VoiceActivityDetector,
    frame_bytes: usize,
    sample_rate: u32,
    /// Buffered speech is cut here even if the speaker never pauses.
    max_utterance_bytes: usize,
    pending: Vec<u8>,
    utterance: Vec<u8>,
}

enum Segmented {
    Started,
    Utterance(Vec<u8>),
}

impl Segmenter {
    fn new(
        threshold: f64,
        silence_ms: u64,
        max_utterance_ms: u64,
        frame_ms: u32,
        sample_rate: u32,
    ) -> Self {
        let frame_bytes = (sample_rate as usize * frame_ms as usize / 1000).max(1) * 2;
        let max_utterance_bytes =
            (u64::from(sample_rate) * max_utterance_ms / 1000 * 2).max(frame_bytes as u64) as usize;
        Self {
            vad: VoiceActivityDetector::with_silence_window(threshold, silence_ms, frame_ms),
            frame_bytes,
            sample_rate,
            max_utterance_bytes,
            pending: Vec::new(),
            utterance: Vec::new(),
        }
    }

    fn push(&mut self, pcm: &[u8]) -> Vec<Segmented> {
        self.pending.extend_from_slice(pcm);
        let mut out = Vec::new();
        while self.pending.len() >= self.frame_bytes {
            let rest = self.pending.split_off(self.frame_bytes);
            let frame = std::mem::replace(&mut self.pending, rest);
            let transition = self.vad.process_frame(&bytes_to_samples(&frame));
            if self.vad.is_active() || transition == Some(VadTransition::SpeechEnded) {
                self.utterance.extend_from_slice(&frame);
            }
            match transition {
                Some(VadTransition::SpeechStarted) => out.push(Segmented::Started),
                Some(VadTransition::SpeechEnded) => out.extend(self.flush()),
                None if self.utterance.len() >= self.max_utterance_bytes => {
                    debug!(bytes = self.utterance.len(), "Utterance hit the length cap, flushing");
                    self.vad.reset();
                    out.extend(self.flush());
                }
                None => {}
            }
        }
        out
    }

    fn flush(&mut self) -> Option<Segmented> {
        let utterance = std::mem::take(&mut self.utterance);
        let ms = (utterance.len() as u64 / 2) * 1000 / u64::from(self.sample_rate.max(1));
        if ms < MIN_UTTERANCE_MS {
            debug!(ms, "Discarding short utterance");
            return None;
        }
        Some(Segmented::Utterance(utterance))
    }
}

#[async_trait]
impl SttProvider for WhisperBatchProvider {
    fn id(&self) -> &str {
        &self.provider_id
    }

    async fn connect(&self) -> anyhow::Result<SttLink> {
        let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(64);
        let (event_tx, event_rx) = mpsc::channel::<anyhow::Result<SttProviderEvent>>(32);
        let (upload_tx, mut upload_rx) = mpsc::channel::<Vec<u8>>(UPLOAD_QUEUE);
        let mut segmenter = Segmenter::new(
            self.vad_threshold,
            self.utterance_end_ms,
            self.max_utterance_ms,
            self.frame_ms,
            self.sample_rate,
        );
        let job = self.upload_job();

        // Uploads run one at a time, in utterance order, off the intake path.
        let results = event_tx.clone();
        tokio::spawn(async move {
            while let Some(audio) = upload_rx.recv().await {
                let events = match job.transcribe(&audio).await {
                    Ok((text, confidence)) => vec![
                        Ok(SttProviderEvent::Transcript {
                            text,
                            is_final: true,
                            confidence,
                        }),
                        Ok(SttProviderEvent::UtteranceEnd),
                    ],
                    Err(e) => {
                        warn!(%e, "Batch transcription failed");
                        vec![Err(e)]
                    }
                };
                for event in events {
                    let failed = event.is_err();
                    if results.send(event).await.is_err() || failed {
                        return;
                    }
                }
            }
        });

        tokio::spawn(async move {
            while let Some(pcm) = audio_rx.recv().await {
                for segment in segmenter.push(&pcm) {
                    let delivered = match segment {
                        Segmented::Started => event_tx
                            .send(Ok(SttProviderEvent::SpeechStarted))
                            .await
                            .is_ok(),
                        Segmented::Utterance(audio) => upload_tx.send(audio).await.is_ok(),
                    };
                    if !delivered {
                        return;
                    }
                }
            }
        });

        Ok(SttLink {
            audio: audio_tx,
            events: Box::pin(ReceiverStream::new(event_rx)),
        })
    }
}
