//! TranscriptionStream: drives an STT provider link from captured frames and
//! turns provider events into session signals.
//!
//! Finalized segments accumulate until the provider reports `UtteranceEnd`,
//! which promotes them to a single [`FinalTranscript`]. A dropped link is
//! reopened with bounded exponential backoff; once the attempts run out the
//! stream reports `Failed` and stops.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rusty_voice_core::config::TranscriptionConfig;
use rusty_voice_core::types::{FinalTranscript, TranscriptEvent};

use crate::capture::FrameReceiver;
use crate::stt::{SttLink, SttProvider, SttProviderEvent};

const MAX_BACKOFF: Duration = Duration::from_secs(5);
/// How long to wait for trailing results after the audio source closes.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// What the transcription stream reports to the session owner.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptionSignal {
    /// A partial or finalized segment, for display and barge-in confirmation.
    Transcript(TranscriptEvent),
    SpeechStarted,
    /// The accumulated utterance, ready for the conversation engine.
    UtteranceEnd(FinalTranscript),
    /// The link could not be re-established.
    Failed { attempts: u32, message: String },
}

/// Accumulates segments for the utterance in progress.
#[derive(Debug, Default)]
pub struct UtteranceAccumulator {
    finals: Vec<(String, f32)>,
    partial: Option<(String, f32)>,
}

impl UtteranceAccumulator {
    pub fn push(&mut self, text: &str, is_final: bool, confidence: f32) {
        let text = text.trim();
        if is_final {
            if !text.is_empty() {
                self.finals.push((text.to_string(), confidence));
            }
            self.partial = None;
        } else if text.is_empty() {
            self.partial = None;
        } else {
            self.partial = Some((text.to_string(), confidence));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.finals.is_empty() && self.partial.is_none()
    }

    /// Promote everything accumulated to a final transcript. `None` if there is no text.
    pub fn take(&mut self, threshold: f32) -> Option<FinalTranscript> {
        let mut segments = std::mem::take(&mut self.finals);
        segments.extend(self.partial.take());
        if segments.is_empty() {
            return None;
        }
        let confidence = segments.iter().map(|(_, c)| c).sum::<f32>() / segments.len() as f32;
        let text = segments
            .into_iter()
            .map(|(t, _)| t)
            .collect::<Vec<_>>()
            .join(" ");
        Some(FinalTranscript::new(text, confidence, threshold))
    }
}

/// Backoff before reconnect `attempt` (zero-based): `base * 2^attempt`, capped at 5 s.
pub fn reconnect_delay(base_ms: u64, attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(factor)).min(MAX_BACKOFF)
}

enum LinkEnd {
    /// Audio source closed and trailing results were flushed.
    SourceClosed,
    Cancelled,
    Dropped { reason: String, productive: bool },
}

pub struct TranscriptionStream {
    provider: Arc<dyn SttProvider>,
    confidence_threshold: f32,
    max_reconnect_attempts: u32,
    reconnect_base_ms: u64,
}

impl TranscriptionStream {
    pub fn new(provider: Arc<dyn SttProvider>, config: &TranscriptionConfig) -> Self {
        Self {
            provider,
            confidence_threshold: config.confidence_threshold,
            max_reconnect_attempts: config.max_reconnect_attempts,
            reconnect_base_ms: config.reconnect_base_ms,
        }
    }

    /// Run in a background task, consuming `frames` and reporting to `out`.
    pub fn spawn<T>(
        self,
        frames: FrameReceiver,
        out: mpsc::Sender<T>,
        cancel: CancellationToken,
    ) -> JoinHandle<()>
    where
        T: From<TranscriptionSignal> + Send + 'static,
    {
        tokio::spawn(async move { self.run(frames, out, cancel).await })
    }

    pub async fn run<T>(
        self,
        mut frames: FrameReceiver,
        out: mpsc::Sender<T>,
        cancel: CancellationToken,
    ) where
        T: From<TranscriptionSignal> + Send + 'static,
    {
        let provider = self.provider.id().to_string();
        let mut attempt: u32 = 0;
        let mut last_error = String::new();
        // Outlives a single link so a reconnect mid-utterance keeps its segments.
        let mut acc = UtteranceAccumulator::default();

        loop {
            if attempt > 0 {
                if attempt > self.max_reconnect_attempts {
                    warn!(%provider, attempts = attempt - 1, error = %last_error, "Transcription failed permanently");
                    let _ = out
                        .send(T::from(TranscriptionSignal::Failed {
                            attempts: attempt - 1,
                            message: last_error,
                        }))
                        .await;
                    return;
                }
                let delay = reconnect_delay(self.reconnect_base_ms, attempt - 1);
                info!(%provider, attempt, delay_ms = delay.as_millis() as u64, "Reconnecting transcription");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let link = tokio::select! {
                _ = cancel.cancelled() => return,
                link = self.provider.connect() => link,
            };
            let link = match link {
                Ok(link) => link,
                Err(e) => {
                    warn!(%provider, %e, "Transcription connect failed");
                    last_error = e.to_string();
                    attempt += 1;
                    continue;
                }
            };

            match self.drive(link, &mut frames, &mut acc, &out, &cancel).await {
                LinkEnd::SourceClosed => {
                    debug!(%provider, "Audio source closed, transcription finished");
                    return;
                }
                LinkEnd::Cancelled => return,
                LinkEnd::Dropped { reason, productive } => {
                    warn!(%provider, %reason, "Transcription link dropped");
                    if productive {
                        attempt = 0;
                    }
                    last_error = reason;
                    attempt += 1;
                }
            }
        }
    }

    async fn drive<T>(
        &self,
        link: SttLink,
        frames: &mut FrameReceiver,
        acc: &mut UtteranceAccumulator,
        out: &mpsc::Sender<T>,
        cancel: &CancellationToken,
    ) -> LinkEnd
    where
        T: From<TranscriptionSignal> + Send + 'static,
    {
        let SttLink { audio, mut events } = link;
        let mut audio = Some(audio);
        let mut productive = false;
        let mut flush_deadline = None;

        loop {
            let deadline = flush_deadline;
            let flush_sleep = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => return LinkEnd::Cancelled,
                _ = flush_sleep => return LinkEnd::SourceClosed,
                frame = frames.recv(), if audio.is_some() => match frame {
                    Some(frame) => {
                        if let Some(tx) = &audio {
                            if tx.send(frame.pcm).await.is_err() {
                                return LinkEnd::Dropped {
                                    reason: "provider stopped accepting audio".into(),
                                    productive,
                                };
                            }
                        }
                    }
                    None => {
                        // Closing the audio side asks the provider to flush.
                        audio = None;
                        flush_deadline = Some(tokio::time::Instant::now() + FLUSH_TIMEOUT);
                    }
                },
                event = events.next() => match event {
                    Some(Ok(event)) => {
                        productive = true;
                        let signal = self.handle_event(event, acc);
                        if let Some(signal) = signal {
                            if out.send(T::from(signal)).await.is_err() {
                                return LinkEnd::Cancelled;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        return LinkEnd::Dropped { reason: e.to_string(), productive };
                    }
                    None if audio.is_none() => return LinkEnd::SourceClosed,
                    None => {
                        return LinkEnd::Dropped {
                            reason: "provider closed the stream".into(),
                            productive,
                        };
                    }
                },
            }
        }
    }

    fn handle_event(
        &self,
        event: SttProviderEvent,
        acc: &mut UtteranceAccumulator,
    ) -> Option<TranscriptionSignal> {
        match event {
            SttProviderEvent::Transcript {
                text,
                is_final,
                confidence,
            } => {
                acc.push(&text, is_final, confidence);
                if text.trim().is_empty() {
                    return None;
                }
                Some(TranscriptionSignal::Transcript(TranscriptEvent {
                    text,
                    is_final,
                    confidence,
                    timestamp: Utc::now(),
                }))
            }
            SttProviderEvent::SpeechStarted => Some(TranscriptionSignal::SpeechStarted),
            SttProviderEvent::UtteranceEnd => match acc.take(self.confidence_threshold) {
                Some(transcript) => {
                    debug!(
                        text = %transcript.text,
                        confidence = transcript.confidence,
                        low_confidence = transcript.low_confidence,
                        "Utterance complete"
                    );
                    Some(TranscriptionSignal::UtteranceEnd(transcript))
                }
                None => {
                    debug!("Utterance end with no transcript, ignoring");
                    None
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use tokio_stream::wrappers::ReceiverStream;

    use super::*;
    use crate::capture::AudioCapture;

    #[test]
    fn test_accumulator_joins_finals_and_trailing_partial() {
        let mut acc = UtteranceAccumulator::default();
        acc.push("what time", false, 0.5);
        acc.push("what time", true, 0.9);
        acc.push("is it", false, 0.7);
        let t = acc.take(0.5).unwrap();
        assert_eq!(t.text, "what time is it");
        assert!((t.confidence - 0.8).abs() < 1e-6);
        assert!(!t.low_confidence);
        assert!(acc.is_empty());
        assert!(acc.take(0.5).is_none());
    }

    #[test]
    fn test_accumulator_low_confidence_is_tagged() {
        let mut acc = UtteranceAccumulator::default();
        acc.push("mumble", true, 0.3);
        let t = acc.take(0.5).unwrap();
        assert!(t.low_confidence);
    }

    #[test]
    fn test_reconnect_delay_caps() {
        assert_eq!(reconnect_delay(250, 0), Duration::from_millis(250));
        assert_eq!(reconnect_delay(250, 2), Duration::from_millis(1000));
        assert_eq!(reconnect_delay(250, 5), MAX_BACKOFF);
        assert_eq!(reconnect_delay(250, 90), MAX_BACKOFF);
    }

    /// Each connect pops a script; an empty script queue fails the connect.
    struct ScriptedStt {
        scripts: Mutex<VecDeque<Vec<SttProviderEvent>>>,
        connects: AtomicU32,
        hold_open: bool,
    }

    #[async_trait]
    impl SttProvider for ScriptedStt {
        fn id(&self) -> &str {
            "scripted"
        }

        async fn connect(&self) -> anyhow::Result<SttLink> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("refused"))?;
            let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(8);
            let (event_tx, event_rx) = mpsc::channel(16);
            let hold_open = self.hold_open;
            tokio::spawn(async move {
                for event in script {
                    let _ = event_tx.send(Ok(event)).await;
                }
                if hold_open {
                    while audio_rx.recv().await.is_some() {}
                }
            });
            Ok(SttLink {
                audio: audio_tx,
                events: Box::pin(ReceiverStream::new(event_rx)),
            })
        }
    }

    fn config() -> TranscriptionConfig {
        TranscriptionConfig {
            reconnect_base_ms: 1,
            max_reconnect_attempts: 2,
            ..TranscriptionConfig::default()
        }
    }

    #[tokio::test]
    async fn test_stream_emits_signals_in_order() {
        let provider = Arc::new(ScriptedStt {
            scripts: Mutex::new(VecDeque::from([vec![
                SttProviderEvent::SpeechStarted,
                SttProviderEvent::Transcript {
                    text: "What time is it?".into(),
                    is_final: true,
                    confidence: 0.95,
                },
                SttProviderEvent::UtteranceEnd,
            ]])),
            connects: AtomicU32::new(0),
            hold_open: true,
        });
        let (tx, frames) = AudioCapture::channel(640, 8);
        let (out_tx, mut out_rx) = mpsc::channel::<TranscriptionSignal>(16);
        let handle = TranscriptionStream::new(provider, &config()).spawn(
            frames,
            out_tx,
            CancellationToken::new(),
        );

        assert_eq!(out_rx.recv().await, Some(TranscriptionSignal::SpeechStarted));
        assert!(matches!(
            out_rx.recv().await,
            Some(TranscriptionSignal::Transcript(ref e)) if e.is_final
        ));
        match out_rx.recv().await {
            Some(TranscriptionSignal::UtteranceEnd(t)) => {
                assert_eq!(t.text, "What time is it?");
                assert!(!t.low_confidence);
            }
            other => panic!("expected utterance end, got {other:?}"),
        }

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_exhaustion_reports_failure() {
        let provider = Arc::new(ScriptedStt {
            scripts: Mutex::new(VecDeque::new()),
            connects: AtomicU32::new(0),
            hold_open: false,
        });
        let (_tx, frames) = AudioCapture::channel(640, 8);
        let (out_tx, mut out_rx) = mpsc::channel::<TranscriptionSignal>(16);
        TranscriptionStream::new(provider.clone(), &config())
            .spawn(frames, out_tx, CancellationToken::new())
            .await
            .unwrap();

        match out_rx.recv().await {
            Some(TranscriptionSignal::Failed { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("expected failure, got {other:?}"),
        }
        // Initial attempt plus two retries.
        assert_eq!(provider.connects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_dropped_link_is_reopened() {
        let provider = Arc::new(ScriptedStt {
            scripts: Mutex::new(VecDeque::from([
                vec![SttProviderEvent::SpeechStarted],
                vec![SttProviderEvent::SpeechStarted],
            ])),
            connects: AtomicU32::new(0),
            hold_open: false,
        });
        let (_tx, frames) = AudioCapture::channel(640, 8);
        let (out_tx, mut out_rx) = mpsc::channel::<TranscriptionSignal>(16);
        let cancel = CancellationToken::new();
        let handle =
            TranscriptionStream::new(provider.clone(), &config()).spawn(frames, out_tx, cancel.clone());

        assert_eq!(out_rx.recv().await, Some(TranscriptionSignal::SpeechStarted));
        assert_eq!(out_rx.recv().await, Some(TranscriptionSignal::SpeechStarted));
        cancel.cancel();
        handle.await.unwrap();
        assert!(provider.connects.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_utterance_survives_reconnect() {
        let provider = Arc::new(ScriptedStt {
            scripts: Mutex::new(VecDeque::from([
                vec![SttProviderEvent::Transcript {
                    text: "What time".into(),
                    is_final: true,
                    confidence: 0.9,
                }],
                vec![
                    SttProviderEvent::Transcript {
                        text: "is it".into(),
                        is_final: true,
                        confidence: 0.9,
                    },
                    SttProviderEvent::UtteranceEnd,
                ],
            ])),
            connects: AtomicU32::new(0),
            hold_open: false,
        });
        let (_tx, frames) = AudioCapture::channel(640, 8);
        let (out_tx, mut out_rx) = mpsc::channel::<TranscriptionSignal>(16);
        let cancel = CancellationToken::new();
        let handle =
            TranscriptionStream::new(provider.clone(), &config()).spawn(frames, out_tx, cancel.clone());

        let utterance = loop {
            match out_rx.recv().await {
                Some(TranscriptionSignal::Transcript(_)) => continue,
                Some(TranscriptionSignal::UtteranceEnd(t)) => break t,
                other => panic!("expected utterance end, got {other:?}"),
            }
        };
        assert_eq!(utterance.text, "What time is it");
        assert!(provider.connects.load(Ordering::SeqCst) >= 2);

        cancel.cancel();
        handle.await.unwrap();
    }
}
