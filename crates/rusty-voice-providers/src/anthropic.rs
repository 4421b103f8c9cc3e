//! Anthropic Messages API provider.
//!
//! Streams text from `/v1/messages` with `stream: true`. System messages
//! are folded into the top-level `system` field in order.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::StreamExt;
use tracing::{debug, trace, warn};

use crate::sse::parse_sse_stream;
use crate::{
    ChatMessage, ChatRole, ChunkUsage, CompletionChunk, CompletionRequest, CompletionStream,
    Credentials, LlmProvider,
};

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    pub base_url: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(base_url: Option<&str>) -> Self {
        Self {
            base_url: base_url
                .unwrap_or(ANTHROPIC_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            client: reqwest::Client::new(),
        }
    }
}

impl Default for AnthropicProvider {
    fn default() -> Self {
        Self::new(None)
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        message: MessageStart,
    },
    ContentBlockDelta {
        delta: BlockDelta,
    },
    MessageDelta {
        #[serde(default)]
        usage: Option<Usage>,
    },
    Error {
        error: ApiError,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageStart {
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

/// Split ordered messages into the `system` string and the alternating
/// user/assistant list the Messages API requires.
pub fn format_messages(messages: &[ChatMessage]) -> (Option<String>, Vec<serde_json::Value>) {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == ChatRole::System && !m.content.is_empty())
        .map(|m| m.content.as_str())
        .collect();

    let mut turns: Vec<(ChatRole, String)> = Vec::new();
    for m in messages
        .iter()
        .filter(|m| m.role != ChatRole::System && !m.content.is_empty())
    {
        match turns.last_mut() {
            Some((role, text)) if *role == m.role => {
                text.push_str("\n\n");
                text.push_str(&m.content);
            }
            _ => turns.push((m.role, m.content.clone())),
        }
    }

    let formatted = turns
        .into_iter()
        .map(|(role, text)| {
            let role = if role == ChatRole::Assistant {
                "assistant"
            } else {
                "user"
            };
            json!({ "role": role, "content": text })
        })
        .collect();

    let system = (!system.is_empty()).then(|| system.join("\n\n"));
    (system, formatted)
}

/// Map one stream event to a chunk. `Err` for in-band API errors.
fn translate_event(event: StreamEvent) -> anyhow::Result<Option<CompletionChunk>> {
    let chunk = match event {
        StreamEvent::MessageStart { message } => message.usage.map(|u| CompletionChunk {
            usage: Some(ChunkUsage {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
            }),
            ..CompletionChunk::default()
        }),
        StreamEvent::ContentBlockDelta {
            delta: BlockDelta::TextDelta { text },
        } if !text.is_empty() => Some(CompletionChunk::text(text)),
        StreamEvent::ContentBlockDelta { .. } => None,
        StreamEvent::MessageDelta { usage } => usage.map(|u| CompletionChunk {
            usage: Some(ChunkUsage {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
            }),
            ..CompletionChunk::default()
        }),
        StreamEvent::Error { error } => {
            anyhow::bail!("Anthropic stream error ({}): {}", error.kind, error.message)
        }
        StreamEvent::Other => None,
    };
    Ok(chunk)
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn id(&self) -> &str {
        "anthropic"
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
        credentials: &Credentials,
    ) -> anyhow::Result<CompletionStream> {
        let Some(api_key) = crate::api_key(credentials) else {
            anyhow::bail!("Anthropic requires ApiKey credentials");
        };

        let (system, messages) = format_messages(&request.messages);
        if messages.is_empty() {
            anyhow::bail!("Anthropic request has no user or assistant messages");
        }

        let body = MessagesRequest {
            model: request.model.clone(),
            max_tokens: request.max_tokens,
            stream: true,
            system,
            messages,
            temperature: request.temperature,
        };

        debug!(model = %body.model, "Streaming Anthropic Messages API");

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Anthropic API error {status}: {body}");
        }

        let sse = Box::pin(parse_sse_stream(response));

        let chunk_stream = futures::stream::unfold(sse, |mut sse| async move {
            loop {
                match sse.next().await {
                    Some(Ok(event)) => {
                        if event.event.as_deref() == Some("message_stop") {
                            return None;
                        }
                        let parsed: StreamEvent = match serde_json::from_str(&event.data) {
                            Ok(e) => e,
                            Err(e) => {
                                trace!(%e, data = %event.data, "Skipping unparsed Anthropic event");
                                continue;
                            }
                        };
                        match translate_event(parsed) {
                            Ok(Some(chunk)) => return Some((Ok(chunk), sse)),
                            Ok(None) => continue,
                            Err(e) => {
                                warn!(%e, "Anthropic stream reported an error");
                                return Some((Err(e), sse));
                            }
                        }
                    }
                    Some(Err(e)) => return Some((Err(e), sse)),
                    None => return None,
                }
            }
        });

        Ok(Box::pin(chunk_stream))
    }
}
