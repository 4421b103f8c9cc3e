//! WebSocket connection lifecycle: optional hello/auth, then one voice session.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use base64::Engine;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use rusty_voice_core::protocol::{ClientFrame, ServerEvent};

use crate::state::{GatewayState, SessionInfo};

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
const OUTBOUND_QUEUE: usize = 256;
const WRITER_DRAIN: Duration = Duration::from_secs(2);

/// Constant-time string comparison to prevent timing attacks.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Check the first client frame against the configured token.
fn authenticate(expected: &str, frame: &ClientFrame) -> Result<(), String> {
    match frame {
        ClientFrame::Hello { token: Some(token) } => {
            if constant_time_eq(token, expected) {
                Ok(())
            } else {
                Err("Invalid token".to_string())
            }
        }
        ClientFrame::Hello { token: None } => Err("Token authentication required".to_string()),
        _ => Err("Expected hello frame for authentication".to_string()),
    }
}

fn to_message(event: &ServerEvent) -> Option<Message> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            error!(%e, "Failed to serialize server event");
            None
        }
    }
}

/// Handle a new WebSocket connection.
pub async fn handle_ws_connection(state: Arc<GatewayState>, ws: WebSocket) {
    let conn_id = Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, "New WebSocket connection");

    let (mut ws_tx, mut ws_rx) = ws.split();

    if let Some(expected) = state.config.gateway_token() {
        let auth_result = tokio::time::timeout(AUTH_TIMEOUT, wait_for_auth(&expected, &mut ws_rx)).await;
        let failure = match auth_result {
            Ok(Ok(())) => None,
            Ok(Err(reason)) => Some(reason),
            Err(_) => Some("Authentication timeout".to_string()),
        };
        if let Some(reason) = failure {
            warn!(conn_id = %conn_id, %reason, "Authentication failed");
            let event = ServerEvent::Error {
                code: "unauthorized".into(),
                message: reason,
            };
            if let Some(msg) = to_message(&event) {
                let _ = ws_tx.send(msg).await;
            }
            let _ = ws_tx.send(Message::Close(None)).await;
            return;
        }
        info!(conn_id = %conn_id, "Client authenticated");
    }

    // Spawn event sender task
    let (out_tx, mut out_rx) = mpsc::channel::<ServerEvent>(OUTBOUND_QUEUE);
    let mut send_task = tokio::spawn(async move {
        while let Some(event) = out_rx.recv().await {
            let Some(msg) = to_message(&event) else { continue };
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    let mut session = state.pipeline.start_session(out_tx.clone());
    state.sessions.write().await.insert(
        conn_id.clone(),
        SessionInfo {
            conn_id: conn_id.clone(),
            session_id: session.id.clone(),
            connected_at: chrono::Utc::now(),
        },
    );
    info!(conn_id = %conn_id, session_id = %session.id, "Voice session attached");

    // Main read loop
    while let Some(msg_result) = ws_rx.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientFrame>(text.as_str()) {
                Ok(ClientFrame::Audio { data }) => {
                    match base64::engine::general_purpose::STANDARD.decode(data.as_bytes()) {
                        Ok(pcm) => {
                            session.push_audio(&pcm);
                        }
                        Err(e) => {
                            let _ = out_tx
                                .send(ServerEvent::Error {
                                    code: "bad_audio".into(),
                                    message: format!("Invalid base64 audio: {e}"),
                                })
                                .await;
                        }
                    }
                }
                Ok(ClientFrame::End) => {
                    debug!(conn_id = %conn_id, "Client ended session");
                    break;
                }
                Ok(ClientFrame::Hello { .. }) => {
                    debug!(conn_id = %conn_id, "Ignoring repeated hello");
                }
                Err(e) => {
                    warn!(%e, "Invalid frame received");
                    let _ = out_tx
                        .send(ServerEvent::Error {
                            code: "parse_error".into(),
                            message: format!("Invalid frame: {e}"),
                        })
                        .await;
                }
            },
            Ok(Message::Binary(pcm)) => {
                session.push_audio(&pcm);
            }
            Ok(Message::Close(_)) => {
                debug!(conn_id = %conn_id, "Client requested close");
                break;
            }
            Err(e) => {
                error!(conn_id = %conn_id, %e, "WebSocket error");
                break;
            }
            _ => {}
        }
    }

    // Cleanup
    match session.finish().await {
        Ok(finished) => info!(
            conn_id = %conn_id,
            session_id = %finished.id,
            turns = finished.turns().len(),
            frames_dropped = finished.metrics.frames_dropped,
            "Voice session finished"
        ),
        Err(e) => error!(conn_id = %conn_id, %e, "Voice session task failed"),
    }
    drop(out_tx);
    if tokio::time::timeout(WRITER_DRAIN, &mut send_task).await.is_err() {
        send_task.abort();
    }
    state.sessions.write().await.remove(&conn_id);
    info!(conn_id = %conn_id, "WebSocket connection closed");
}

/// Wait for the client's hello frame and authenticate.
async fn wait_for_auth(
    expected: &str,
    ws_rx: &mut futures::stream::SplitStream<WebSocket>,
) -> Result<(), String> {
    while let Some(msg_result) = ws_rx.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                let frame = serde_json::from_str::<ClientFrame>(text.as_str())
                    .map_err(|e| format!("Invalid frame: {e}"))?;
                return authenticate(expected, &frame);
            }
            Ok(Message::Close(_)) => return Err("Connection closed during auth".to_string()),
            Err(e) => return Err(format!("WebSocket error during auth: {e}")),
            _ => continue,
        }
    }
    Err("Connection dropped during auth".to_string())
}
