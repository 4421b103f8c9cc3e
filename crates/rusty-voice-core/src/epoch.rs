//! Turn epochs: the cancellation token for in-flight async work.
//!
//! The supervisor holds the only [`EpochCounter`]. Every other component gets an
//! [`EpochReader`] and tags its results with the epoch that was current when the
//! work started. A result whose tag no longer matches is discarded.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{Result, VoiceError};

/// Monotonic turn epoch.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Epoch(u64);

impl Epoch {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Writer half. Not `Clone`: only the session owner may advance the epoch.
#[derive(Debug, Default)]
pub struct EpochCounter {
    value: Arc<AtomicU64>,
}

impl EpochCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Epoch {
        Epoch(self.value.load(Ordering::SeqCst))
    }

    /// Increment the epoch and return the new value.
    pub fn advance(&self) -> Epoch {
        Epoch(self.value.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn reader(&self) -> EpochReader {
        EpochReader {
            value: Arc::clone(&self.value),
        }
    }
}

/// Read-only view of the session epoch.
#[derive(Debug, Clone)]
pub struct EpochReader {
    value: Arc<AtomicU64>,
}

impl EpochReader {
    pub fn current(&self) -> Epoch {
        Epoch(self.value.load(Ordering::SeqCst))
    }

    pub fn is_current(&self, tagged: Epoch) -> bool {
        self.current() == tagged
    }

    /// Fail with [`VoiceError::StaleEpoch`] if `tagged` has been superseded.
    pub fn ensure_current(&self, tagged: Epoch) -> Result<()> {
        let current = self.current();
        if current == tagged {
            Ok(())
        } else {
            Err(VoiceError::StaleEpoch { tagged, current })
        }
    }
}
