//! Failover provider: wraps multiple providers in priority order.
//!
//! If opening a stream fails, the next provider is tried. Failures after a
//! stream has opened are surfaced to the caller unchanged.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::{CompletionRequest, CompletionStream, Credentials, LlmProvider};

/// A provider with its own credentials and model override.
pub struct FailoverEntry {
    pub provider: Arc<dyn LlmProvider>,
    pub credentials: Credentials,
    /// Replaces the request model when this entry is a fallback.
    pub model: Option<String>,
}

pub struct FailoverProvider {
    entries: Vec<FailoverEntry>,
    label: String,
}

impl FailoverProvider {
    /// The first entry is primary; others are fallbacks.
    pub fn new(label: impl Into<String>, entries: Vec<FailoverEntry>) -> Self {
        Self {
            entries,
            label: label.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl LlmProvider for FailoverProvider {
    fn id(&self) -> &str {
        &self.label
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
        _credentials: &Credentials,
    ) -> anyhow::Result<CompletionStream> {
        let mut last_error = None;

        for (i, entry) in self.entries.iter().enumerate() {
            let attempt_request;
            let request = match (&entry.model, i) {
                (Some(model), i) if i > 0 => {
                    attempt_request = CompletionRequest {
                        model: model.clone(),
                        ..request.clone()
                    };
                    &attempt_request
                }
                _ => request,
            };

            match entry.provider.stream(request, &entry.credentials).await {
                Ok(stream) => {
                    if i > 0 {
                        info!(
                            provider = entry.provider.id(),
                            attempt = i + 1,
                            "Failover succeeded"
                        );
                    }
                    return Ok(stream);
                }
                Err(e) => {
                    warn!(
                        provider = entry.provider.id(),
                        attempt = i + 1,
                        %e,
                        "Provider failed, trying next"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("No providers configured in failover")))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio_stream::StreamExt;

    use super::*;
    use crate::{ChatMessage, CompletionChunk};

    struct Scripted {
        id: &'static str,
        fail: bool,
        seen_models: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(id: &'static str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                id,
                fail,
                seen_models: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for Scripted {
        fn id(&self) -> &str {
            self.id
        }

        async fn stream(
            &self,
            request: &CompletionRequest,
            _credentials: &Credentials,
        ) -> anyhow::Result<CompletionStream> {
            self.seen_models.lock().unwrap().push(request.model.clone());
            if self.fail {
                anyhow::bail!("{} is down", self.id);
            }
            let chunks = vec![Ok(CompletionChunk::text(self.id))];
            Ok(Box::pin(tokio_stream::iter(chunks)))
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            model: "primary-model".into(),
            messages: vec![ChatMessage::user("hi")],
            max_tokens: 16,
            temperature: None,
        }
    }

    #[test]
    fn test_failover_provider_creation() {
        let provider = FailoverProvider::new("test-failover", vec![]);
        assert_eq!(provider.id(), "test-failover");
        assert!(provider.is_empty());
    }

    #[tokio::test]
    async fn test_empty_failover_errors() {
        let provider = FailoverProvider::new("empty", vec![]);
        let result = provider.stream(&request(), &Credentials::None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_falls_back_with_model_override() {
        let primary = Scripted::new("primary", true);
        let backup = Scripted::new("backup", false);
        let provider = FailoverProvider::new(
            "chain",
            vec![
                FailoverEntry {
                    provider: primary.clone(),
                    credentials: Credentials::None,
                    model: None,
                },
                FailoverEntry {
                    provider: backup.clone(),
                    credentials: Credentials::None,
                    model: Some("backup-model".into()),
                },
            ],
        );

        let mut stream = provider.stream(&request(), &Credentials::None).await.unwrap();
        let chunk = stream.next().await.unwrap().unwrap();
        assert_eq!(chunk.delta.as_deref(), Some("backup"));
        assert_eq!(primary.seen_models.lock().unwrap().as_slice(), ["primary-model"]);
        assert_eq!(backup.seen_models.lock().unwrap().as_slice(), ["backup-model"]);
    }
}
