use std::time::Duration;

use thiserror::Error;

use crate::epoch::Epoch;
use crate::session::SessionState;

#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("Config error: {0}")]
    Config(String),

    /// A provider link dropped or could not be established.
    #[error("Connection error ({provider}): {message}")]
    Connection { provider: String, message: String },

    #[error("Generation timed out after {0:?}")]
    GenerationTimeout(Duration),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Synthesis failure: {0}")]
    SynthesisFailure(String),

    /// A result tagged with an epoch that is no longer current. Never surfaced to the user.
    #[error("Stale result from epoch {tagged} (current {current})")]
    StaleEpoch { tagged: Epoch, current: Epoch },

    #[error("Budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Invalid session transition: {from} -> {to}")]
    InvalidTransition { from: SessionState, to: SessionState },

    #[error("Session error: {0}")]
    Session(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VoiceError {
    /// Build a connection error for the named provider.
    pub fn connection(provider: &str, message: impl Into<String>) -> Self {
        Self::Connection {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    /// Short machine-readable code used in client error frames and metric labels.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Connection { .. } => "connection",
            Self::GenerationTimeout(_) => "generation_timeout",
            Self::Generation(_) => "generation",
            Self::SynthesisFailure(_) => "synthesis_failure",
            Self::StaleEpoch { .. } => "stale_epoch",
            Self::BudgetExceeded(_) => "budget_exceeded",
            Self::DeviceUnavailable(_) => "device_unavailable",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Session(_) => "session",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Other(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, VoiceError>;
