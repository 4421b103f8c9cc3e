//! ConversationEngine: one assistant turn from final transcript to fragments.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rusty_voice_core::config::Config;
use rusty_voice_core::epoch::{Epoch, EpochReader};
use rusty_voice_core::error::VoiceError;
use rusty_voice_core::session::Turn;
use rusty_voice_core::types::{FinalTranscript, FragmentKind, TextFragment};
use rusty_voice_providers::{ChunkUsage, CompletionRequest, Credentials, LlmProvider};

use crate::memory::{MemoryLookup, MemoryWriter};
use crate::prompt::{build_messages, build_system_prompt};

/// Tunables for the engine, lifted out of [`Config`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub persona: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
    pub history_turns: usize,
    pub fragment_timeout: Duration,
    pub retry_backoff: Duration,
    pub clarification_text: String,
    pub unavailable_text: String,
    pub memory_limit: usize,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        let agent = &config.agent;
        Self {
            persona: agent.system_prompt.clone(),
            model: config.model(),
            max_tokens: agent.max_tokens,
            temperature: agent.temperature,
            history_turns: agent.history_turns,
            fragment_timeout: Duration::from_millis(agent.first_fragment_timeout_ms),
            retry_backoff: Duration::from_millis(agent.retry_backoff_ms),
            clarification_text: agent.clarification_text.clone(),
            unavailable_text: agent.unavailable_text.clone(),
            memory_limit: if config.memory.enabled {
                config.memory.lookup_limit
            } else {
                0
            },
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Input for one turn. `epoch` is the epoch captured when the turn started.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub epoch: Epoch,
    pub transcript: FinalTranscript,
    pub history: Vec<Turn>,
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// The stream finished normally.
    Completed {
        text: String,
        ttft: Duration,
        tokens: u64,
    },
    /// Low-confidence transcript answered with the clarification text.
    Clarified { text: String },
    /// Generation failed twice; the unavailable text was emitted.
    Fallback { text: String },
    /// The stream broke after fragments were already emitted.
    Truncated {
        text: String,
        ttft: Duration,
        tokens: u64,
    },
    /// The epoch moved on or the turn was cancelled.
    Cancelled,
}

impl TurnOutcome {
    /// Metric label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::Clarified { .. } => "clarified",
            Self::Fallback { .. } => "fallback",
            Self::Truncated { .. } => "truncated",
            Self::Cancelled => "cancelled",
        }
    }

    /// Text to record as the assistant turn. The fallback apology is not part
    /// of the conversation.
    pub fn assistant_text(&self) -> Option<&str> {
        match self {
            Self::Completed { text, .. }
            | Self::Clarified { text }
            | Self::Truncated { text, .. } => Some(text),
            Self::Fallback { .. } | Self::Cancelled => None,
        }
    }

    pub fn ttft(&self) -> Option<Duration> {
        match self {
            Self::Completed { ttft, .. } | Self::Truncated { ttft, .. } => Some(*ttft),
            _ => None,
        }
    }

    /// Tokens the provider reported for this turn (input plus output).
    pub fn tokens(&self) -> u64 {
        match self {
            Self::Completed { tokens, .. } | Self::Truncated { tokens, .. } => *tokens,
            _ => 0,
        }
    }
}

/// Partial output of a broken stream: text so far, TTFT and tokens.
type Partial = (String, Duration, u64);

enum Attempt {
    Done {
        text: String,
        ttft: Duration,
        tokens: u64,
    },
    Failed {
        error: VoiceError,
        partial: Option<Partial>,
    },
    Cancelled,
}

/// Provider usage reports may repeat or be cumulative; keep the highest of each.
#[derive(Debug, Default, Clone, Copy)]
struct UsageTally {
    input: u64,
    output: u64,
}

impl UsageTally {
    fn observe(&mut self, usage: &ChunkUsage) {
        self.input = self.input.max(usage.input_tokens.unwrap_or(0));
        self.output = self.output.max(usage.output_tokens.unwrap_or(0));
    }

    fn total(self) -> u64 {
        self.input + self.output
    }
}

pub struct ConversationEngine {
    provider: Arc<dyn LlmProvider>,
    credentials: Credentials,
    memory: Arc<dyn MemoryLookup>,
    writer: Option<Arc<dyn MemoryWriter>>,
    settings: EngineSettings,
}

impl ConversationEngine {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        credentials: Credentials,
        memory: Arc<dyn MemoryLookup>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            provider,
            credentials,
            memory,
            writer: None,
            settings,
        }
    }

    /// Hand completed exchanges to `writer`.
    pub fn with_writer(mut self, writer: Arc<dyn MemoryWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Run one turn, sending fragments tagged with `request.epoch` to `out`.
    ///
    /// Every send is preceded by an epoch check. Once the epoch moves on or
    /// `cancel` fires, upstream consumption stops and nothing more is sent.
    pub async fn respond(
        &self,
        request: TurnRequest,
        epoch: &EpochReader,
        cancel: &CancellationToken,
        out: &mpsc::Sender<TextFragment>,
    ) -> TurnOutcome {
        let tagged = request.epoch;
        if cancel.is_cancelled() || !epoch.is_current(tagged) {
            return TurnOutcome::Cancelled;
        }

        if request.transcript.low_confidence {
            debug!(
                epoch = %tagged,
                confidence = request.transcript.confidence,
                "Low-confidence transcript, asking for clarification"
            );
            let text = self.settings.clarification_text.clone();
            return match emit(epoch, out, tagged, &text, FragmentKind::Clarification).await {
                true => TurnOutcome::Clarified { text },
                false => TurnOutcome::Cancelled,
            };
        }

        let started = Instant::now();
        let user_text = request.transcript.text.trim().to_string();
        let facts = tokio::select! {
            _ = cancel.cancelled() => return TurnOutcome::Cancelled,
            facts = self.lookup_memory(&user_text) => facts,
        };

        let system = build_system_prompt(self.settings.persona.as_deref());
        let completion = CompletionRequest {
            model: self.settings.model.clone(),
            messages: build_messages(
                &system,
                &facts,
                &request.history,
                self.settings.history_turns,
                &user_text,
            ),
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
        };

        let mut last_error = None;
        for attempt in 0..2u32 {
            if attempt > 0 {
                tokio::select! {
                    _ = cancel.cancelled() => return TurnOutcome::Cancelled,
                    _ = tokio::time::sleep(self.settings.retry_backoff) => {}
                }
            }
            match self
                .generate(&completion, tagged, epoch, cancel, out, started)
                .await
            {
                Attempt::Done { text, ttft, tokens } => {
                    info!(
                        epoch = %tagged,
                        ttft_ms = ttft.as_millis() as u64,
                        chars = text.len(),
                        tokens,
                        "Turn generated"
                    );
                    self.write_back(epoch, tagged, &user_text, &text).await;
                    return TurnOutcome::Completed { text, ttft, tokens };
                }
                Attempt::Failed {
                    error,
                    partial: Some((text, ttft, tokens)),
                } => {
                    warn!(epoch = %tagged, %error, "Generation broke mid-stream");
                    return TurnOutcome::Truncated { text, ttft, tokens };
                }
                Attempt::Failed {
                    error,
                    partial: None,
                } => {
                    warn!(epoch = %tagged, attempt, %error, "Generation attempt failed");
                    last_error = Some(error);
                }
                Attempt::Cancelled => return TurnOutcome::Cancelled,
            }
        }

        if let Some(error) = last_error {
            warn!(epoch = %tagged, code = error.code(), "Generation unavailable, sending fallback");
        }
        let text = self.settings.unavailable_text.clone();
        match emit(epoch, out, tagged, &text, FragmentKind::Fallback).await {
            true => TurnOutcome::Fallback { text },
            false => TurnOutcome::Cancelled,
        }
    }

    async fn lookup_memory(&self, query: &str) -> Vec<String> {
        if self.settings.memory_limit == 0 {
            return Vec::new();
        }
        match self.memory.lookup(query, self.settings.memory_limit).await {
            Ok(mut facts) => {
                facts.truncate(self.settings.memory_limit);
                facts
            }
            Err(e) => {
                warn!(error = %e, "Memory lookup failed, continuing without memory");
                Vec::new()
            }
        }
    }

    async fn write_back(&self, epoch: &EpochReader, tagged: Epoch, user: &str, assistant: &str) {
        let Some(writer) = &self.writer else {
            return;
        };
        if !epoch.is_current(tagged) {
            return;
        }
        if let Err(e) = writer.remember(user, assistant).await {
            warn!(error = %e, "Memory write-back failed");
        }
    }

    async fn generate(
        &self,
        request: &CompletionRequest,
        tagged: Epoch,
        epoch: &EpochReader,
        cancel: &CancellationToken,
        out: &mpsc::Sender<TextFragment>,
        started: Instant,
    ) -> Attempt {
        let timeout = self.settings.fragment_timeout;
        let opened = tokio::select! {
            _ = cancel.cancelled() => return Attempt::Cancelled,
            opened = tokio::time::timeout(timeout, self.provider.stream(request, &self.credentials)) => opened,
        };
        let mut stream = match opened {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Attempt::Failed {
                    error: VoiceError::Generation(e.to_string()),
                    partial: None,
                };
            }
            Err(_) => {
                return Attempt::Failed {
                    error: VoiceError::GenerationTimeout(timeout),
                    partial: None,
                };
            }
        };

        let mut text = String::new();
        let mut ttft = None;
        let mut usage = UsageTally::default();
        let fail = |error: VoiceError, text: String, ttft: Option<Duration>, usage: UsageTally| {
            Attempt::Failed {
                error,
                partial: ttft.map(|t| (text, t, usage.total())),
            }
        };

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Attempt::Cancelled,
                next = tokio::time::timeout(timeout, stream.next()) => next,
            };
            let chunk = match next {
                Ok(None) => break,
                Ok(Some(Ok(chunk))) => chunk,
                Ok(Some(Err(e))) => {
                    return fail(VoiceError::Generation(e.to_string()), text, ttft, usage);
                }
                Err(_) => return fail(VoiceError::GenerationTimeout(timeout), text, ttft, usage),
            };

            if let Some(reported) = &chunk.usage {
                usage.observe(reported);
            }
            let Some(delta) = chunk.delta.filter(|d| !d.is_empty()) else {
                continue;
            };
            if !epoch.is_current(tagged) {
                debug!(epoch = %tagged, "Epoch superseded, abandoning generation");
                return Attempt::Cancelled;
            }
            ttft.get_or_insert_with(|| started.elapsed());
            text.push_str(&delta);
            if out.send(TextFragment::generated(tagged, delta)).await.is_err() {
                return Attempt::Cancelled;
            }
        }

        match ttft {
            Some(ttft) if !text.trim().is_empty() => Attempt::Done {
                text,
                ttft,
                tokens: usage.total(),
            },
            _ => Attempt::Failed {
                error: VoiceError::Generation("empty completion".into()),
                partial: None,
            },
        }
    }
}

/// Send one fixed fragment if `tagged` is still current.
async fn emit(
    epoch: &EpochReader,
    out: &mpsc::Sender<TextFragment>,
    tagged: Epoch,
    text: &str,
    kind: FragmentKind,
) -> bool {
    if !epoch.is_current(tagged) {
        return false;
    }
    let fragment = TextFragment {
        epoch: tagged,
        text: text.to_string(),
        kind,
    };
    out.send(fragment).await.is_ok()
}
