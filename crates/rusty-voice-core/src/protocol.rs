//! Client transport wire protocol.
//!
//! JSON text frames over a WebSocket, tagged by `type`. Audio travels as
//! base64 in both directions: 16 kHz mono PCM inbound, provider-encoded
//! audio outbound.

use serde::{Deserialize, Serialize};

use crate::epoch::Epoch;
use crate::session::{Role, SessionState};
use crate::types::FragmentKind;

/// Client -> server frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// First frame when the gateway requires auth.
    Hello {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    /// Base64-encoded PCM audio.
    Audio { data: String },
    /// End the session.
    End,
}

/// Server -> client event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Status {
        state: SessionState,
        epoch: Epoch,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Transcript {
        text: String,
        is_final: bool,
        confidence: f32,
    },
    Fragment {
        epoch: Epoch,
        text: String,
        kind: FragmentKind,
    },
    Audio {
        epoch: Epoch,
        seq: u64,
        /// Base64-encoded audio in the configured synthesis output format.
        data: String,
    },
    /// Stop playback immediately and drop anything buffered.
    AudioStop { epoch: Epoch },
    /// Synthesis failed for this text; show it instead of speaking it.
    TextOnly { epoch: Epoch, text: String },
    BargeIn { epoch: Epoch },
    Halted { reason: String },
    Turn { role: Role, text: String },
    Error { code: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_frame_parsing() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"audio","data":"AAAA"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Audio { ref data } if data == "AAAA"));

        let frame: ClientFrame = serde_json::from_str(r#"{"type":"hello"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Hello { token: None }));

        let frame: ClientFrame = serde_json::from_str(r#"{"type":"end"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::End));
    }

    #[test]
    fn test_status_event_shape() {
        let event = ServerEvent::Status {
            state: SessionState::Thinking,
            epoch: Epoch::new(3),
            detail: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "status");
        assert_eq!(value["state"], "thinking");
        assert_eq!(value["epoch"], 3);
        assert!(value.get("detail").is_none());
    }

    #[test]
    fn test_audio_stop_tag() {
        let value = serde_json::to_value(ServerEvent::AudioStop {
            epoch: Epoch::new(1),
        })
        .unwrap();
        assert_eq!(value["type"], "audio_stop");
    }
}
