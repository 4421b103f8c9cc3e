//! Per-session wiring: capture queue, transcription, supervisor and audio sink.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use rusty_voice_agent::{
    ConversationEngine, EngineSettings, FileMemoryStore, MemoryLookup, NoMemory,
};
use rusty_voice_core::config::{BargeInConfig, BudgetConfig, Config, TranscriptionConfig, TtsConfig};
use rusty_voice_core::epoch::Epoch;
use rusty_voice_core::protocol::ServerEvent;
use rusty_voice_core::session::Session;
use rusty_voice_core::types::AudioChunk;
use rusty_voice_media::capture::{AudioCapture, FrameSender};
use rusty_voice_media::sink::AudioSink;
use rusty_voice_media::stt::{self, SttProvider};
use rusty_voice_media::synthesis::SpeechSynthesisStream;
use rusty_voice_media::transcription::TranscriptionStream;
use rusty_voice_media::tts_stream::{self, TtsProvider};
use rusty_voice_providers::registry;

use crate::budget;
use crate::metrics;
use crate::supervisor::{Supervisor, SupervisorEvent};

const INBOX_CAPACITY: usize = 128;

/// Forwards synthesized audio to the WebSocket client as base64 `audio` events.
pub struct ClientAudioSink {
    outbound: mpsc::Sender<ServerEvent>,
}

impl ClientAudioSink {
    pub fn new(outbound: mpsc::Sender<ServerEvent>) -> Self {
        Self { outbound }
    }
}

#[async_trait]
impl AudioSink for ClientAudioSink {
    async fn play(&self, chunk: AudioChunk) -> anyhow::Result<()> {
        let data = base64::engine::general_purpose::STANDARD.encode(&chunk.data);
        self.outbound
            .send(ServerEvent::Audio {
                epoch: chunk.epoch,
                seq: chunk.seq,
                data,
            })
            .await
            .map_err(|_| anyhow::anyhow!("client disconnected"))
    }

    async fn stop(&self, epoch: Epoch) {
        let _ = self.outbound.send(ServerEvent::AudioStop { epoch }).await;
    }
}

/// Providers shared by every session, built once from config.
pub struct PipelineFactory {
    stt: Arc<dyn SttProvider>,
    tts: Arc<dyn TtsProvider>,
    engine: Arc<ConversationEngine>,
    transcription: TranscriptionConfig,
    tts_config: TtsConfig,
    barge_in: BargeInConfig,
    budget: BudgetConfig,
    frame_bytes: usize,
    queue_frames: usize,
}

impl PipelineFactory {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let stt = stt::build_provider(&config.transcription, &config.capture)?;
        let tts = tts_stream::build_provider(&config.tts)?;
        let llm = registry::resolve(config)?;

        let memory: Arc<dyn MemoryLookup>;
        let mut store = None;
        if config.memory.enabled {
            let file = Arc::new(FileMemoryStore::new(
                config.memory_path(),
                config.memory.max_entries,
            ));
            memory = file.clone();
            store = Some(file);
        } else {
            memory = Arc::new(NoMemory);
        }

        let mut engine = ConversationEngine::new(
            llm.provider,
            llm.credentials,
            memory,
            EngineSettings::from_config(config),
        );
        if let Some(store) = store.filter(|_| config.memory.write_back) {
            engine = engine.with_writer(store);
        }

        info!(
            stt = stt.id(),
            tts = tts.id(),
            model = %config.model(),
            memory = config.memory.enabled,
            "Voice pipeline ready"
        );
        Ok(Self::new(stt, tts, Arc::new(engine), config))
    }

    /// Assemble from already-built components.
    pub fn new(
        stt: Arc<dyn SttProvider>,
        tts: Arc<dyn TtsProvider>,
        engine: Arc<ConversationEngine>,
        config: &Config,
    ) -> Self {
        Self {
            stt,
            tts,
            engine,
            transcription: config.transcription.clone(),
            tts_config: config.tts.clone(),
            barge_in: config.barge_in.clone(),
            budget: config.budget.clone(),
            frame_bytes: config.frame_bytes(),
            queue_frames: config.capture.queue_frames,
        }
    }

    /// Start a session whose output goes to `outbound`.
    pub fn start_session(&self, outbound: mpsc::Sender<ServerEvent>) -> SessionHandle {
        let sink: Arc<dyn AudioSink> = Arc::new(ClientAudioSink::new(outbound.clone()));
        self.start_session_with_sink(outbound, sink)
    }

    /// Start a session that plays audio through `sink`.
    pub fn start_session_with_sink(
        &self,
        outbound: mpsc::Sender<ServerEvent>,
        sink: Arc<dyn AudioSink>,
    ) -> SessionHandle {
        let (frames, frame_rx) = AudioCapture::channel(self.frame_bytes, self.queue_frames);
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        let cancel = CancellationToken::new();

        let transcription = TranscriptionStream::new(Arc::clone(&self.stt), &self.transcription)
            .spawn(frame_rx, inbox_tx.clone(), cancel.clone());

        let synthesis = SpeechSynthesisStream::new(Arc::clone(&self.tts), sink, &self.tts_config);
        let session = Session::new();
        let session_id = session.id.clone();
        let supervisor = Supervisor::new(
            session,
            Arc::clone(&self.engine),
            synthesis,
            budget::from_config(&self.budget),
            self.barge_in.clone(),
            inbox_tx.clone(),
            outbound,
        );

        metrics::record_session_start();
        let supervisor_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let session = supervisor.run(inbox_rx).await;
            supervisor_cancel.cancel();
            if let Err(e) = transcription.await {
                warn!(%e, "Transcription task panicked");
            }
            metrics::record_session_end();
            session
        });

        SessionHandle {
            id: session_id,
            frames,
            inbox: inbox_tx,
            cancel,
            task,
        }
    }
}

/// The connection's handle on a running session.
pub struct SessionHandle {
    pub id: String,
    frames: FrameSender,
    inbox: mpsc::Sender<SupervisorEvent>,
    cancel: CancellationToken,
    task: JoinHandle<Session>,
}

impl SessionHandle {
    /// Queue raw 16-bit PCM from the client.
    pub fn push_audio(&mut self, pcm: &[u8]) -> usize {
        self.frames.push_pcm(pcm)
    }

    /// Close the audio source, end the supervisor and wait for the final session.
    pub async fn finish(mut self) -> anyhow::Result<Session> {
        self.frames.close();
        let dropped = self.frames.dropped();
        metrics::record_frames_dropped(dropped);
        let _ = self.inbox.send(SupervisorEvent::End).await;
        let mut session = self.task.await?;
        session.metrics.frames_dropped = dropped;
        self.cancel.cancel();
        Ok(session)
    }
}
