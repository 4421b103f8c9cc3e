//! Scripted in-memory providers shared by the gateway tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;

use rusty_voice_agent::{ConversationEngine, EngineSettings, NoMemory};
use rusty_voice_core::epoch::Epoch;
use rusty_voice_core::types::AudioChunk;
use rusty_voice_media::sink::AudioSink;
use rusty_voice_media::stt::{SttEventStream, SttLink, SttProvider};
use rusty_voice_media::tts_stream::{AudioByteStream, TtsProvider};
use rusty_voice_providers::{
    ChunkUsage, CompletionChunk, CompletionRequest, CompletionStream, Credentials, LlmProvider,
};

/// Streams a fixed reply word by word.
pub struct StubLlm {
    reply: String,
    calls: AtomicUsize,
    /// Output tokens reported after the text, if any.
    usage: Option<u64>,
}

impl StubLlm {
    pub fn new(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: reply.to_string(),
            calls: AtomicUsize::new(0),
            usage: None,
        })
    }

    pub fn metered(reply: &str, output_tokens: u64) -> Arc<Self> {
        Arc::new(Self {
            reply: reply.to_string(),
            calls: AtomicUsize::new(0),
            usage: Some(output_tokens),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for StubLlm {
    fn id(&self) -> &str {
        "stub-llm"
    }

    async fn stream(
        &self,
        _request: &CompletionRequest,
        _credentials: &Credentials,
    ) -> anyhow::Result<CompletionStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut chunks: Vec<anyhow::Result<CompletionChunk>> = self
            .reply
            .split_inclusive(' ')
            .map(|w| Ok(CompletionChunk::text(w)))
            .collect();
        if let Some(output_tokens) = self.usage {
            chunks.push(Ok(CompletionChunk {
                usage: Some(ChunkUsage {
                    input_tokens: None,
                    output_tokens: Some(output_tokens),
                }),
                ..Default::default()
            }));
        }
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

/// One audio chunk per word, each delayed by `delay`.
pub struct StubTts {
    delay: Duration,
}

impl StubTts {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self { delay })
    }
}

#[async_trait]
impl TtsProvider for StubTts {
    fn id(&self) -> &str {
        "stub-tts"
    }

    async fn synthesize(&self, text: &str) -> anyhow::Result<AudioByteStream> {
        let delay = self.delay;
        let words: Vec<Bytes> = text
            .split_whitespace()
            .map(|w| Bytes::from(w.to_string()))
            .collect();
        let stream = futures::stream::iter(words).then(move |word| async move {
            tokio::time::sleep(delay).await;
            Ok::<_, anyhow::Error>(word)
        });
        Ok(Box::pin(stream))
    }
}

/// Never reports anything; audio is drained and discarded.
pub struct SilentStt;

#[async_trait]
impl SttProvider for SilentStt {
    fn id(&self) -> &str {
        "silent"
    }

    async fn connect(&self) -> anyhow::Result<SttLink> {
        let (audio, mut rx) = mpsc::channel::<Vec<u8>>(16);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        let events: SttEventStream = Box::pin(futures::stream::pending::<
            anyhow::Result<rusty_voice_media::stt::SttProviderEvent>,
        >());
        Ok(SttLink { audio, events })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkCall {
    Play { epoch: Epoch, seq: u64 },
    Stop { epoch: Epoch },
}

/// Records every sink call in order.
#[derive(Default)]
pub struct RecordingSink {
    calls: Mutex<Vec<SinkCall>>,
}

impl RecordingSink {
    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn played(&self, epoch: Epoch) -> Vec<u64> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                SinkCall::Play { epoch: e, seq } if e == epoch => Some(seq),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl AudioSink for RecordingSink {
    async fn play(&self, chunk: AudioChunk) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(SinkCall::Play {
            epoch: chunk.epoch,
            seq: chunk.seq,
        });
        Ok(())
    }

    async fn stop(&self, epoch: Epoch) {
        self.calls.lock().unwrap().push(SinkCall::Stop { epoch });
    }
}

pub fn engine(llm: Arc<StubLlm>) -> Arc<ConversationEngine> {
    let settings = EngineSettings {
        retry_backoff: Duration::from_millis(10),
        ..EngineSettings::default()
    };
    Arc::new(ConversationEngine::new(
        llm,
        Credentials::None,
        Arc::new(NoMemory),
        settings,
    ))
}
