//! Build the configured language model provider.

use std::sync::Arc;

use rusty_voice_core::config::{Config, ProviderConfig};
use tracing::info;

use crate::anthropic::AnthropicProvider;
use crate::failover::{FailoverEntry, FailoverProvider};
use crate::openai::OpenAiProvider;
use crate::{Credentials, LlmProvider};

/// The provider the engine talks to, with the credentials to pass along.
pub struct ResolvedProvider {
    pub provider: Arc<dyn LlmProvider>,
    pub credentials: Credentials,
}

/// Instantiate one provider from its config entry.
pub fn build_provider(config: &ProviderConfig) -> anyhow::Result<Arc<dyn LlmProvider>> {
    let base_url = config.base_url.as_deref();
    let provider: Arc<dyn LlmProvider> = match config.id.as_str() {
        "anthropic" => Arc::new(AnthropicProvider::new(base_url)),
        "openai" => Arc::new(OpenAiProvider::openai(base_url)),
        "openrouter" => Arc::new(OpenAiProvider::openrouter(base_url)),
        "ollama" => Arc::new(OpenAiProvider::ollama(base_url)),
        other => anyhow::bail!("Unknown model provider: {other}"),
    };
    Ok(provider)
}

fn credentials_for(config: &ProviderConfig) -> Credentials {
    match config.resolve_api_key() {
        Some(api_key) => Credentials::ApiKey { api_key },
        None => Credentials::None,
    }
}

/// Resolve the provider chain from config. One entry is used directly;
/// several are wrapped in a [`FailoverProvider`] in listed order.
pub fn resolve(config: &Config) -> anyhow::Result<ResolvedProvider> {
    let providers = &config.models.providers;
    match providers.as_slice() {
        [] => anyhow::bail!("No model providers configured (models.providers is empty)"),
        [single] => {
            let provider = build_provider(single)?;
            info!(provider = provider.id(), model = %config.model(), "Model provider ready");
            Ok(ResolvedProvider {
                provider,
                credentials: credentials_for(single),
            })
        }
        many => {
            let entries = many
                .iter()
                .map(|p| {
                    Ok(FailoverEntry {
                        provider: build_provider(p)?,
                        credentials: credentials_for(p),
                        model: p.default_model.clone(),
                    })
                })
                .collect::<anyhow::Result<Vec<_>>>()?;
            let label = many
                .iter()
                .map(|p| p.id.as_str())
                .collect::<Vec<_>>()
                .join("+");
            info!(chain = %label, "Model failover chain ready");
            Ok(ResolvedProvider {
                provider: Arc::new(FailoverProvider::new(label, entries)),
                credentials: Credentials::None,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(id: &str) -> ProviderConfig {
        ProviderConfig {
            id: id.into(),
            api_key_env: None,
            api_key: Some("sk-test".into()),
            base_url: None,
            default_model: None,
        }
    }

    #[test]
    fn test_empty_providers_is_error() {
        assert!(resolve(&Config::default()).is_err());
    }

    #[test]
    fn test_single_provider() {
        let mut config = Config::default();
        config.models.providers.push(provider("anthropic"));
        let resolved = resolve(&config).unwrap();
        assert_eq!(resolved.provider.id(), "anthropic");
        assert!(matches!(resolved.credentials, Credentials::ApiKey { .. }));
    }

    #[test]
    fn test_multiple_providers_build_failover() {
        let mut config = Config::default();
        config.models.providers.push(provider("openai"));
        config.models.providers.push(provider("anthropic"));
        let resolved = resolve(&config).unwrap();
        assert_eq!(resolved.provider.id(), "openai+anthropic");
    }

    #[test]
    fn test_unknown_provider() {
        assert!(build_provider(&provider("carrier-pigeon")).is_err());
    }
}
