//! Text-generation providers
//!
//! The agent talks to every backend through [`ProviderAdapter`]. Adapters
//! classify their own failures as retryable or fatal; retry policy lives in
//! the handler.

mod openai;

pub use openai::OpenAiChatProvider;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{AgentConfig, ConfigError};
use crate::error::ProviderError;
use crate::message::{ChatMessage, GenerationOptions};

/// Everything a provider needs for one completion
#[derive(Debug, Clone, PartialEq)]
pub struct PromptRequest {
    pub prompt: String,
    /// Prior turns, oldest first
    pub history: Vec<ChatMessage>,
    pub options: GenerationOptions,
}

/// Token accounting reported by the provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// A successful completion
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    pub model: String,
    pub usage: Usage,
    pub provider: String,
    pub request_id: Option<String>,
}

/// Uniform interface to a text-generation backend
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Short provider name reported in responses and metrics
    fn name(&self) -> &str;

    /// Produce a completion for `request`
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] whose kind tells the caller whether
    /// another attempt can succeed.
    async fn generate(&self, request: &PromptRequest) -> Result<Completion, ProviderError>;

    /// Release held resources
    async fn close(&self) {}
}

/// Build the provider named by `config.llm_provider`
///
/// # Errors
///
/// Returns `ConfigError` for unknown provider names or missing credentials.
pub fn create_provider(config: &AgentConfig) -> Result<Arc<dyn ProviderAdapter>, ConfigError> {
    match config.llm_provider.as_str() {
        "openai" => {
            let api_key = config.openai_api_key.clone().ok_or_else(|| {
                ConfigError::MissingEnvVar("BEAST_OPENAI_API_KEY".to_string())
            })?;
            let provider = OpenAiChatProvider::new(&config.openai_base_url, api_key)?;
            Ok(Arc::new(provider))
        }
        other => Err(ConfigError::ValidationError(format!(
            "unknown llm_provider '{other}', expected one of: openai"
        ))),
    }
}
