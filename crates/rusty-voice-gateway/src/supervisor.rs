//! Session supervisor: the single owner of a [`Session`].
//!
//! Transcription, the conversation engine and speech synthesis never call each
//! other. They report to the supervisor inbox, and the supervisor decides what
//! happens next: start a turn, enter `Speaking`, finish a turn, or barge in.
//!
//! Barge-in advances the epoch, cancels the active turn's token, stops the
//! audio sink and returns to `Listening`. The epoch check is what actually
//! keeps stale work out; the token only makes the old tasks stop early.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use rusty_voice_agent::{ConversationEngine, TurnOutcome, TurnRequest};
use rusty_voice_core::config::BargeInConfig;
use rusty_voice_core::epoch::{Epoch, EpochReader};
use rusty_voice_core::protocol::ServerEvent;
use rusty_voice_core::session::{Role, Session, SessionState, Turn};
use rusty_voice_core::types::{FinalTranscript, TextFragment};
use rusty_voice_media::synthesis::{SpeechSynthesisStream, SynthesisEvent};
use rusty_voice_media::transcription::TranscriptionSignal;

use crate::budget::BudgetGuard;
use crate::metrics;

const FRAGMENT_QUEUE: usize = 64;

/// Everything the supervisor reacts to.
#[derive(Debug)]
pub enum SupervisorEvent {
    Transcription(TranscriptionSignal),
    Synthesis(SynthesisEvent),
    EngineDone { epoch: Epoch, outcome: TurnOutcome },
    /// The client hung up or asked to end the session.
    End,
}

impl From<TranscriptionSignal> for SupervisorEvent {
    fn from(signal: TranscriptionSignal) -> Self {
        Self::Transcription(signal)
    }
}

impl From<SynthesisEvent> for SupervisorEvent {
    fn from(event: SynthesisEvent) -> Self {
        Self::Synthesis(event)
    }
}

/// The one in-flight assistant turn.
struct ActiveTurn {
    epoch: Epoch,
    cancel: CancellationToken,
    engine_done: bool,
    synthesis_done: bool,
}

pub struct Supervisor {
    session: Session,
    engine: Arc<ConversationEngine>,
    synthesis: SpeechSynthesisStream,
    budget: Box<dyn BudgetGuard>,
    barge_in: BargeInConfig,
    history_turns: usize,
    inbox: mpsc::Sender<SupervisorEvent>,
    outbound: mpsc::Sender<ServerEvent>,
    active: Option<ActiveTurn>,
    /// Epoch the most recent turn ran under; the next turn needs a fresh one.
    last_turn_epoch: Option<Epoch>,
    /// Deadline of an unconfirmed barge-in (debounce mode only).
    pending_barge_in: Option<Instant>,
    /// Utterance that ended while a turn was still running; the latest wins.
    queued_utterance: Option<FinalTranscript>,
}

impl Supervisor {
    /// `inbox` must be the sending half of the receiver later passed to [`run`](Self::run).
    pub fn new(
        session: Session,
        engine: Arc<ConversationEngine>,
        synthesis: SpeechSynthesisStream,
        budget: Box<dyn BudgetGuard>,
        barge_in: BargeInConfig,
        inbox: mpsc::Sender<SupervisorEvent>,
        outbound: mpsc::Sender<ServerEvent>,
    ) -> Self {
        let history_turns = engine.settings().history_turns;
        Self {
            session,
            engine,
            synthesis,
            budget,
            barge_in,
            history_turns,
            inbox,
            outbound,
            active: None,
            last_turn_epoch: None,
            pending_barge_in: None,
            queued_utterance: None,
        }
    }

    pub fn epoch_reader(&self) -> EpochReader {
        self.session.epoch_reader()
    }

    /// Process events until the session ends or fails. Returns the session.
    pub async fn run(mut self, mut inbox: mpsc::Receiver<SupervisorEvent>) -> Session {
        self.transition(SessionState::Connecting, None).await;
        self.transition(SessionState::Listening, None).await;
        info!(session_id = %self.session.id, "Voice session started");

        while let Some(event) = inbox.recv().await {
            let keep_going = match event {
                SupervisorEvent::Transcription(signal) => self.on_transcription(signal).await,
                SupervisorEvent::Synthesis(event) => {
                    self.on_synthesis(event).await;
                    true
                }
                SupervisorEvent::EngineDone { epoch, outcome } => {
                    self.on_engine_done(epoch, outcome).await;
                    true
                }
                SupervisorEvent::End => false,
            };
            if !keep_going {
                break;
            }
        }

        if let Some(turn) = self.active.take() {
            turn.cancel.cancel();
            self.session.advance_epoch();
        }
        if !self.session.state().is_terminal() {
            self.transition(SessionState::Ended, None).await;
        }
        info!(
            session_id = %self.session.id,
            turns = self.session.turns().len(),
            barge_ins = self.session.metrics.barge_ins,
            stale = self.session.metrics.stale_results,
            mean_ttft_ms = ?self.session.metrics.mean_ttft_ms(),
            "Voice session ended"
        );
        self.session
    }

    async fn emit(&self, event: ServerEvent) {
        if self.outbound.send(event).await.is_err() {
            debug!(session_id = %self.session.id, "Client gone, dropping event");
        }
    }

    async fn transition(&mut self, to: SessionState, detail: Option<String>) {
        match self.session.transition(to) {
            Ok(from) => {
                debug!(session_id = %self.session.id, %from, %to, "Session state changed");
                self.emit(ServerEvent::Status {
                    state: to,
                    epoch: self.session.epoch(),
                    detail,
                })
                .await;
            }
            Err(e) => warn!(session_id = %self.session.id, %e, "Rejected state transition"),
        }
    }

    /// Returns `false` when the session cannot continue.
    async fn on_transcription(&mut self, signal: TranscriptionSignal) -> bool {
        match signal {
            TranscriptionSignal::SpeechStarted => {
                if !self.barge_in.enabled || self.active.is_none() {
                    return true;
                }
                if self.barge_in.debounce_ms == 0 {
                    self.barge_in().await;
                } else {
                    let window = std::time::Duration::from_millis(self.barge_in.debounce_ms);
                    self.pending_barge_in = Some(Instant::now() + window);
                    debug!(session_id = %self.session.id, "Barge-in armed");
                }
            }
            TranscriptionSignal::Transcript(event) => {
                let confirmed = !event.text.trim().is_empty()
                    && self
                        .pending_barge_in
                        .take()
                        .is_some_and(|deadline| Instant::now() <= deadline);
                self.emit(ServerEvent::Transcript {
                    text: event.text,
                    is_final: event.is_final,
                    confidence: event.confidence,
                })
                .await;
                if confirmed && self.active.is_some() {
                    self.barge_in().await;
                }
            }
            TranscriptionSignal::UtteranceEnd(transcript) => {
                let confirmed = !transcript.text.trim().is_empty()
                    && self
                        .pending_barge_in
                        .take()
                        .is_some_and(|deadline| Instant::now() <= deadline);
                if self.active.is_none() {
                    self.start_turn(transcript).await;
                } else if confirmed {
                    self.barge_in().await;
                    self.start_turn(transcript).await;
                } else {
                    debug!(session_id = %self.session.id, "Turn still running, queueing utterance");
                    if self.queued_utterance.replace(transcript).is_some() {
                        debug!(session_id = %self.session.id, "Replaced an earlier queued utterance");
                    }
                }
            }
            TranscriptionSignal::Failed { attempts, message } => {
                error!(session_id = %self.session.id, attempts, %message, "Transcription unavailable");
                if let Some(turn) = self.active.take() {
                    turn.cancel.cancel();
                    self.session.advance_epoch();
                }
                self.emit(ServerEvent::Error {
                    code: "connection".into(),
                    message: format!("transcription failed after {attempts} attempts: {message}"),
                })
                .await;
                self.transition(SessionState::Failed, Some(message)).await;
                return false;
            }
        }
        true
    }

    /// Cancel the active turn and return to `Listening`.
    async fn barge_in(&mut self) {
        let Some(turn) = self.active.take() else {
            return;
        };
        let epoch = self.session.advance_epoch();
        turn.cancel.cancel();
        self.synthesis.stop(turn.epoch).await;
        self.pending_barge_in = None;
        // The user is speaking again; whatever they say next supersedes it.
        self.queued_utterance = None;

        self.session.metrics.barge_ins += 1;
        metrics::record_barge_in();
        info!(session_id = %self.session.id, from = %turn.epoch, to = %epoch, "Barge-in");

        self.emit(ServerEvent::BargeIn { epoch }).await;
        self.transition(SessionState::Listening, Some("barge_in".into()))
            .await;
    }

    async fn start_turn(&mut self, transcript: FinalTranscript) {
        if self.session.state() != SessionState::Listening {
            warn!(session_id = %self.session.id, state = %self.session.state(), "Utterance outside Listening, ignoring");
            return;
        }
        if let Err(e) = self.budget.check(&self.session) {
            info!(session_id = %self.session.id, %e, "Turn refused by budget");
            metrics::record_turn("halted");
            self.emit(ServerEvent::Halted {
                reason: e.to_string(),
            })
            .await;
            return;
        }

        let epoch = match self.last_turn_epoch {
            Some(last) if last == self.session.epoch() => self.session.advance_epoch(),
            _ => self.session.epoch(),
        };
        self.last_turn_epoch = Some(epoch);

        let history = self.session.recent_turns(self.history_turns).to_vec();
        self.session.append_turn(Turn::user(transcript.text.clone()));
        self.emit(ServerEvent::Turn {
            role: Role::User,
            text: transcript.text.clone(),
        })
        .await;
        self.transition(SessionState::Thinking, None).await;

        let cancel = CancellationToken::new();
        self.active = Some(ActiveTurn {
            epoch,
            cancel: cancel.clone(),
            engine_done: false,
            synthesis_done: false,
        });
        debug!(session_id = %self.session.id, %epoch, "Turn started");

        let reader = self.session.epoch_reader();
        let (fragment_tx, mut fragment_rx) = mpsc::channel::<TextFragment>(FRAGMENT_QUEUE);
        let (speak_tx, speak_rx) = mpsc::channel::<TextFragment>(FRAGMENT_QUEUE);

        self.synthesis.spawn(
            epoch,
            reader.clone(),
            speak_rx,
            self.inbox.clone(),
            cancel.clone(),
        );

        // Fragments go to the client and to synthesis, in generation order.
        let outbound = self.outbound.clone();
        let tee_reader = reader.clone();
        tokio::spawn(async move {
            let mut stale = 0u64;
            while let Some(fragment) = fragment_rx.recv().await {
                if !tee_reader.is_current(fragment.epoch) {
                    stale += 1;
                    continue;
                }
                let _ = outbound
                    .send(ServerEvent::Fragment {
                        epoch: fragment.epoch,
                        text: fragment.text.clone(),
                        kind: fragment.kind,
                    })
                    .await;
                if speak_tx.send(fragment).await.is_err() {
                    break;
                }
            }
            metrics::record_stale("fragment", stale);
        });

        let engine = Arc::clone(&self.engine);
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let request = TurnRequest {
                epoch,
                transcript,
                history,
            };
            let outcome = engine.respond(request, &reader, &cancel, &fragment_tx).await;
            drop(fragment_tx);
            let _ = inbox.send(SupervisorEvent::EngineDone { epoch, outcome }).await;
        });
    }

    fn is_active(&self, epoch: Epoch) -> bool {
        self.session.epoch() == epoch && self.active.as_ref().is_some_and(|t| t.epoch == epoch)
    }

    async fn on_engine_done(&mut self, epoch: Epoch, outcome: TurnOutcome) {
        metrics::record_turn(outcome.label());
        // Spent tokens count against the budget even when the result is stale.
        self.session.metrics.tokens_used += outcome.tokens();
        metrics::record_tokens(outcome.tokens());
        if !self.is_active(epoch) {
            if !matches!(outcome, TurnOutcome::Cancelled) {
                self.session.metrics.stale_results += 1;
                metrics::record_stale("turn", 1);
            }
            debug!(session_id = %self.session.id, %epoch, outcome = outcome.label(), "Discarding stale turn result");
            return;
        }

        if let Some(ttft) = outcome.ttft() {
            self.session.metrics.record_ttft(ttft);
            metrics::record_ttft(ttft);
        }
        if let Some(text) = outcome.assistant_text() {
            self.session.append_turn(Turn::assistant(text));
            self.session.metrics.turns_completed += 1;
            self.emit(ServerEvent::Turn {
                role: Role::Assistant,
                text: text.to_string(),
            })
            .await;
        }
        info!(session_id = %self.session.id, %epoch, outcome = outcome.label(), "Turn generated");

        if let Some(turn) = self.active.as_mut() {
            turn.engine_done = true;
        }
        self.maybe_finish_turn().await;
    }

    async fn on_synthesis(&mut self, event: SynthesisEvent) {
        match event {
            SynthesisEvent::FirstAudio { epoch } => {
                if self.is_active(epoch) && self.session.state() == SessionState::Thinking {
                    self.transition(SessionState::Speaking, None).await;
                }
            }
            SynthesisEvent::TextOnly { epoch, text } => {
                if self.is_active(epoch) {
                    self.emit(ServerEvent::TextOnly { epoch, text }).await;
                } else {
                    self.session.metrics.stale_results += 1;
                    metrics::record_stale("fragment", 1);
                }
            }
            SynthesisEvent::Finished {
                epoch,
                chunks_played,
                stale_discarded,
            } => {
                self.session.metrics.stale_results += stale_discarded;
                metrics::record_stale("audio", stale_discarded);
                debug!(session_id = %self.session.id, %epoch, chunks_played, stale_discarded, "Playback drained");
                if !self.is_active(epoch) {
                    return;
                }
                if let Some(turn) = self.active.as_mut() {
                    turn.synthesis_done = true;
                }
                self.maybe_finish_turn().await;
            }
        }
    }

    /// Back to `Listening` once generation and playback are both done.
    async fn maybe_finish_turn(&mut self) {
        let done = self
            .active
            .as_ref()
            .is_some_and(|t| t.engine_done && t.synthesis_done);
        if !done {
            return;
        }
        self.active = None;
        self.transition(SessionState::Listening, None).await;
        if let Some(next) = self.queued_utterance.take() {
            self.start_turn(next).await;
        }
    }
}
