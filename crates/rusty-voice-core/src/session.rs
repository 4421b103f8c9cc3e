//! Session model: state machine, turn history, epoch and latency metrics.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::epoch::{Epoch, EpochCounter, EpochReader};
use crate::error::{Result, VoiceError};

/// Conversational state of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Listening,
    Thinking,
    Speaking,
    /// Unrecoverable provider failure; the session will not take more turns.
    Failed,
    Ended,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Listening => "listening",
            Self::Thinking => "thinking",
            Self::Speaking => "speaking",
            Self::Failed => "failed",
            Self::Ended => "ended",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Ended)
    }

    /// Whether an assistant turn is in flight.
    pub fn is_responding(self) -> bool {
        matches!(self, Self::Thinking | Self::Speaking)
    }

    /// Legal edges of the state machine. `Speaking` is only reachable from `Thinking`.
    pub fn can_transition_to(self, to: SessionState) -> bool {
        use SessionState::*;
        match (self, to) {
            (Ended, _) => false,
            (_, Ended) => true,
            (Failed, _) => false,
            (_, Failed) => true,
            (Idle, Connecting)
            | (Connecting, Listening)
            | (Listening, Thinking)
            | (Thinking, Speaking)
            | (Thinking, Listening)
            | (Speaking, Listening) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One entry of the conversation history. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    pub created_at: DateTime<Utc>,
    /// Reference to synthesized audio, when the client stores it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_ref: Option<String>,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            created_at: Utc::now(),
            audio_ref: None,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            created_at: Utc::now(),
            audio_ref: None,
        }
    }
}

/// Running latency and discard counters for a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMetrics {
    /// Time to first fragment per completed generation, in milliseconds.
    pub ttft_ms: Vec<u64>,
    pub stale_results: u64,
    pub frames_dropped: u64,
    pub barge_ins: u64,
    pub turns_completed: u64,
    /// Provider-reported tokens, including turns that were later discarded.
    pub tokens_used: u64,
}

impl SessionMetrics {
    pub fn record_ttft(&mut self, ttft: Duration) {
        self.ttft_ms
            .push(u64::try_from(ttft.as_millis()).unwrap_or(u64::MAX));
    }

    pub fn last_ttft_ms(&self) -> Option<u64> {
        self.ttft_ms.last().copied()
    }

    pub fn mean_ttft_ms(&self) -> Option<u64> {
        if self.ttft_ms.is_empty() {
            return None;
        }
        Some(self.ttft_ms.iter().sum::<u64>() / self.ttft_ms.len() as u64)
    }
}

/// A live voice session. Owned and mutated only by its supervisor.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub metrics: SessionMetrics,
    state: SessionState,
    turns: Vec<Turn>,
    epoch: EpochCounter,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            metrics: SessionMetrics::default(),
            state: SessionState::Idle,
            turns: Vec::new(),
            epoch: EpochCounter::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `to`, returning the previous state.
    pub fn transition(&mut self, to: SessionState) -> Result<SessionState> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(VoiceError::InvalidTransition { from, to });
        }
        self.state = to;
        Ok(from)
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch.current()
    }

    pub fn advance_epoch(&mut self) -> Epoch {
        self.epoch.advance()
    }

    pub fn epoch_reader(&self) -> EpochReader {
        self.epoch.reader()
    }

    pub fn append_turn(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// The last `k` turns, oldest first.
    pub fn recent_turns(&self, k: usize) -> &[Turn] {
        let start = self.turns.len().saturating_sub(k);
        &self.turns[start..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut session = Session::new();
        for to in [
            SessionState::Connecting,
            SessionState::Listening,
            SessionState::Thinking,
            SessionState::Speaking,
            SessionState::Listening,
            SessionState::Ended,
        ] {
            session.transition(to).unwrap();
        }
        assert_eq!(session.state(), SessionState::Ended);
    }

    #[test]
    fn test_listening_cannot_jump_to_speaking() {
        let mut session = Session::new();
        session.transition(SessionState::Connecting).unwrap();
        session.transition(SessionState::Listening).unwrap();
        let err = session.transition(SessionState::Speaking).unwrap_err();
        assert!(matches!(
            err,
            VoiceError::InvalidTransition {
                from: SessionState::Listening,
                to: SessionState::Speaking
            }
        ));
        assert_eq!(session.state(), SessionState::Listening);
    }

    #[test]
    fn test_terminal_states_are_sticky() {
        assert!(!SessionState::Ended.can_transition_to(SessionState::Listening));
        assert!(!SessionState::Failed.can_transition_to(SessionState::Listening));
        assert!(SessionState::Failed.can_transition_to(SessionState::Ended));
        assert!(SessionState::Speaking.can_transition_to(SessionState::Failed));
    }

    #[test]
    fn test_recent_turns_window() {
        let mut session = Session::new();
        for i in 0..5 {
            session.append_turn(Turn::user(format!("turn {i}")));
        }
        let recent = session.recent_turns(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].text, "turn 3");
        assert_eq!(recent[1].text, "turn 4");
        assert_eq!(session.recent_turns(50).len(), 5);
    }

    #[test]
    fn test_ttft_metrics() {
        let mut metrics = SessionMetrics::default();
        assert_eq!(metrics.mean_ttft_ms(), None);
        metrics.record_ttft(Duration::from_millis(300));
        metrics.record_ttft(Duration::from_millis(500));
        assert_eq!(metrics.last_ttft_ms(), Some(500));
        assert_eq!(metrics.mean_ttft_ms(), Some(400));
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&SessionState::Speaking).unwrap();
        assert_eq!(json, "\"speaking\"");
    }
}
