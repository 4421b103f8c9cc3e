use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::epoch::Epoch;

/// One fixed-size block of 16-bit little-endian PCM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Monotonic sequence number assigned by the capture side.
    pub seq: u64,
    pub pcm: Vec<u8>,
}

impl AudioFrame {
    /// Decode the frame into samples.
    pub fn samples(&self) -> Vec<i16> {
        self.pcm
            .chunks_exact(2)
            .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
            .collect()
    }

    /// Duration of the frame in milliseconds for mono audio at `sample_rate`.
    pub fn duration_ms(&self, sample_rate: u32) -> u64 {
        if sample_rate == 0 {
            return 0;
        }
        (self.pcm.len() as u64 / 2) * 1000 / u64::from(sample_rate)
    }
}

/// A transcript update from the speech-to-text provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEvent {
    pub text: String,
    pub is_final: bool,
    /// Provider confidence in `[0, 1]`.
    pub confidence: f32,
    pub timestamp: DateTime<Utc>,
}

/// The transcript handed to the conversation engine when an utterance ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalTranscript {
    pub text: String,
    pub confidence: f32,
    /// Confidence fell below the configured threshold; answer with a clarification.
    pub low_confidence: bool,
    pub timestamp: DateTime<Utc>,
}

impl FinalTranscript {
    pub fn new(text: impl Into<String>, confidence: f32, threshold: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
            low_confidence: confidence < threshold,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentKind {
    /// Streamed from the language model.
    Generated,
    /// Fixed reply to a low-confidence transcript.
    Clarification,
    /// Fixed reply after generation failed twice.
    Fallback,
}

/// A piece of assistant text, tagged with the epoch it was produced under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextFragment {
    pub epoch: Epoch,
    pub text: String,
    pub kind: FragmentKind,
}

impl TextFragment {
    pub fn generated(epoch: Epoch, text: impl Into<String>) -> Self {
        Self {
            epoch,
            text: text.into(),
            kind: FragmentKind::Generated,
        }
    }
}

/// Encoded audio produced by the synthesis provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub epoch: Epoch,
    /// Position within the turn, starting at zero.
    pub seq: u64,
    pub data: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_samples_little_endian() {
        let frame = AudioFrame {
            seq: 0,
            pcm: vec![0x01, 0x00, 0xff, 0xff],
        };
        assert_eq!(frame.samples(), vec![1, -1]);
    }

    #[test]
    fn test_frame_duration() {
        let frame = AudioFrame {
            seq: 0,
            pcm: vec![0; 640],
        };
        assert_eq!(frame.duration_ms(16_000), 20);
        assert_eq!(frame.duration_ms(0), 0);
    }

    #[test]
    fn test_low_confidence_flag() {
        assert!(FinalTranscript::new("huh", 0.3, 0.5).low_confidence);
        assert!(!FinalTranscript::new("What time is it?", 0.95, 0.5).low_confidence);
        assert!(!FinalTranscript::new("edge", 0.5, 0.5).low_confidence);
    }
}
