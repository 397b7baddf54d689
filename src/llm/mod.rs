//! LLM access for the research, proposal and reply-classification work.
//!
//! Drafting (research reports, proposals) and reply classification can run
//! on different models of the same backend, each with its own time limit.
//! Both go through rig-core, bridged to `LlmProvider` by `RigAdapter`.

pub mod provider;
mod rig_adapter;

pub use provider::*;
pub use rig_adapter::RigAdapter;

use std::sync::Arc;
use std::time::Duration;

use rig::client::CompletionClient;
use rig::completion::CompletionModel;
use secrecy::{ExposeSecret, SecretString};
use tracing::info;

use crate::error::LlmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Anthropic,
    OpenAi,
}

impl LlmBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
        }
    }

    fn default_model(&self) -> &'static str {
        match self {
            Self::Anthropic => "claude-sonnet-4-20250514",
            Self::OpenAi => "gpt-4o",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: SecretString,
    /// Model for research reports and proposal drafts.
    pub model: String,
    /// Model for reply classification. `None` reuses `model`.
    pub classifier_model: Option<String>,
    /// Per-request limit for drafting calls.
    pub drafting_timeout: Duration,
    /// Per-request limit for classification calls.
    pub classification_timeout: Duration,
}

impl LlmConfig {
    pub const DEFAULT_DRAFTING_TIMEOUT: Duration = Duration::from_secs(45);
    pub const DEFAULT_CLASSIFICATION_TIMEOUT: Duration = Duration::from_secs(15);

    /// Defaults for `backend` with the given key.
    pub fn new(backend: LlmBackend, api_key: SecretString) -> Self {
        Self {
            backend,
            api_key,
            model: backend.default_model().to_string(),
            classifier_model: None,
            drafting_timeout: Self::DEFAULT_DRAFTING_TIMEOUT,
            classification_timeout: Self::DEFAULT_CLASSIFICATION_TIMEOUT,
        }
    }

    pub fn classification_model(&self) -> &str {
        self.classifier_model.as_deref().unwrap_or(&self.model)
    }
}

/// The two providers the pipeline uses.
#[derive(Clone)]
pub struct LlmProviders {
    pub drafting: Arc<dyn LlmProvider>,
    pub classification: Arc<dyn LlmProvider>,
}

/// Build the drafting and classification providers from one backend client.
pub fn create_providers(config: &LlmConfig) -> Result<LlmProviders, LlmError> {
    let drafting_model = config.model.clone();
    let classification_model = config.classification_model().to_string();

    let providers = match config.backend {
        LlmBackend::Anthropic => {
            use rig::providers::anthropic;
            let client: rig::client::Client<anthropic::client::AnthropicExt> =
                anthropic::Client::new(config.api_key.expose_secret())
                    .map_err(|e| client_error(config.backend, e))?;
            LlmProviders {
                drafting: adapter(
                    client.completion_model(&drafting_model),
                    &drafting_model,
                    config.drafting_timeout,
                ),
                classification: adapter(
                    client.completion_model(&classification_model),
                    &classification_model,
                    config.classification_timeout,
                ),
            }
        }
        LlmBackend::OpenAi => {
            use rig::providers::openai;
            let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
                openai::Client::new(config.api_key.expose_secret())
                    .map_err(|e| client_error(config.backend, e))?;
            LlmProviders {
                drafting: adapter(
                    client.completion_model(&drafting_model),
                    &drafting_model,
                    config.drafting_timeout,
                ),
                classification: adapter(
                    client.completion_model(&classification_model),
                    &classification_model,
                    config.classification_timeout,
                ),
            }
        }
    };

    info!(
        backend = config.backend.as_str(),
        drafting_model = %drafting_model,
        classification_model = %classification_model,
        "LLM providers ready"
    );
    Ok(providers)
}

fn adapter<M>(model: M, name: &str, timeout: Duration) -> Arc<dyn LlmProvider>
where
    M: CompletionModel + Send + Sync + 'static,
{
    Arc::new(RigAdapter::new(model, name).with_timeout(timeout))
}

fn client_error(backend: LlmBackend, e: impl std::fmt::Display) -> LlmError {
    LlmError::RequestFailed {
        provider: backend.as_str().to_string(),
        reason: format!("client setup failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_shares_the_drafting_model_by_default() {
        let config = LlmConfig::new(LlmBackend::Anthropic, SecretString::from("test-key"));
        let providers = create_providers(&config).unwrap();
        assert_eq!(providers.drafting.model_name(), "claude-sonnet-4-20250514");
        assert_eq!(providers.classification.model_name(), "claude-sonnet-4-20250514");
    }

    #[test]
    fn classifier_model_override_is_used_for_replies_only() {
        let config = LlmConfig {
            classifier_model: Some("gpt-4o-mini".to_string()),
            ..LlmConfig::new(LlmBackend::OpenAi, SecretString::from("sk-test"))
        };
        let providers = create_providers(&config).unwrap();
        assert_eq!(providers.drafting.model_name(), "gpt-4o");
        assert_eq!(providers.classification.model_name(), "gpt-4o-mini");
    }
}
