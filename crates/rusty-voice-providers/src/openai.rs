//! OpenAI Chat Completions API provider.
//!
//! Implements streaming chat completions via OpenAI's `/v1/chat/completions` API.
//! Also serves OpenRouter, Ollama, and other OpenAI-compatible endpoints.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::StreamExt;
use tracing::{debug, trace};

use crate::sse::parse_sse_stream;
use crate::{
    ChatMessage, ChatRole, ChunkUsage, CompletionChunk, CompletionRequest, CompletionStream,
    Credentials, LlmProvider,
};

const OPENAI_BASE_URL: &str = "https://api.openai.com";
const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api";
const OLLAMA_BASE_URL: &str = "http://localhost:11434";

/// API style; selects minor request and parsing differences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiStyle {
    OpenAi,
    OpenRouter,
    Ollama,
}

pub struct OpenAiProvider {
    pub base_url: String,
    pub api_style: ApiStyle,
    provider_id: String,
    client: reqwest::Client,
}

impl OpenAiProvider {
    fn with_style(base_url: Option<&str>, default_url: &str, style: ApiStyle, id: &str) -> Self {
        Self {
            base_url: base_url
                .unwrap_or(default_url)
                .trim_end_matches('/')
                .to_string(),
            api_style: style,
            provider_id: id.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn openai(base_url: Option<&str>) -> Self {
        Self::with_style(base_url, OPENAI_BASE_URL, ApiStyle::OpenAi, "openai")
    }

    pub fn openrouter(base_url: Option<&str>) -> Self {
        Self::with_style(base_url, OPENROUTER_BASE_URL, ApiStyle::OpenRouter, "openrouter")
    }

    pub fn ollama(base_url: Option<&str>) -> Self {
        Self::with_style(base_url, OLLAMA_BASE_URL, ApiStyle::Ollama, "ollama")
    }
}

// --- OpenAI request/response types ---

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<serde_json::Value>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

fn role_name(role: ChatRole) -> &'static str {
    match role {
        ChatRole::System => "system",
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
    }
}

/// Convert ordered chat messages to the wire format. System messages keep
/// their position, so the memory block stays right after the instructions.
pub fn format_messages(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .filter(|m| !m.content.is_empty())
        .map(|m| json!({ "role": role_name(m.role), "content": m.content }))
        .collect()
}

/// Translate one decoded chunk into a completion chunk, if it carries anything.
fn translate_chunk(chunk: ChatCompletionChunk) -> Option<CompletionChunk> {
    if let Some(usage) = chunk.usage {
        return Some(CompletionChunk {
            usage: Some(ChunkUsage {
                input_tokens: Some(usage.prompt_tokens),
                output_tokens: Some(usage.completion_tokens),
            }),
            ..CompletionChunk::default()
        });
    }

    let choice = chunk.choices.into_iter().next()?;
    choice
        .delta
        .content
        .filter(|c| !c.is_empty())
        .map(CompletionChunk::text)
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn id(&self) -> &str {
        &self.provider_id
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
        credentials: &Credentials,
    ) -> anyhow::Result<CompletionStream> {
        let api_key = crate::api_key(credentials);
        if api_key.is_none() && self.api_style != ApiStyle::Ollama {
            anyhow::bail!("{} requires ApiKey credentials", self.provider_id);
        }

        let body = OpenAiRequest {
            model: request.model.clone(),
            messages: format_messages(&request.messages),
            max_tokens: request.max_tokens,
            stream: true,
            temperature: request.temperature,
            stream_options: Some(StreamOptions {
                include_usage: true,
            }),
        };

        debug!(model = %body.model, base_url = %self.base_url, "Streaming OpenAI-compatible API");

        let mut req_builder = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("content-type", "application/json");

        if let Some(key) = api_key {
            req_builder = req_builder.header("authorization", format!("Bearer {key}"));
        }
        if self.api_style == ApiStyle::OpenRouter {
            req_builder = req_builder.header("HTTP-Referer", "https://rusty-voice.dev");
        }

        let response = req_builder.json(&body).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("OpenAI API error {status}: {body}");
        }

        let sse = Box::pin(parse_sse_stream(response));

        let chunk_stream = futures::stream::unfold(sse, |mut sse| async move {
            loop {
                match sse.next().await {
                    Some(Ok(event)) => {
                        let data = event.data.trim();
                        // OpenAI terminates with "data: [DONE]"
                        if data == "[DONE]" {
                            return None;
                        }
                        let chunk: ChatCompletionChunk = match serde_json::from_str(data) {
                            Ok(c) => c,
                            Err(e) => {
                                trace!(%e, data, "Failed to parse OpenAI chunk");
                                continue;
                            }
                        };
                        if let Some(c) = translate_chunk(chunk) {
                            return Some((Ok(c), sse));
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
