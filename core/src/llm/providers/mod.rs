//! LLM provider implementations

pub mod anthropic;
pub mod openai;

pub use anthropic::AnthropicClient;
pub use openai::OpenAiClient;

use crate::config::{Protocol, ResolvedLlmConfig};
use crate::error::{ConfigError, Result};
use crate::llm::LlmClient;
use std::sync::Arc;

/// Build a client for a resolved model configuration
pub fn create_client(config: &ResolvedLlmConfig) -> Result<Arc<dyn LlmClient>> {
    config.validate().map_err(|message| ConfigError::InvalidFormat { message })?;

    tracing::debug!(
        "Creating {} client for model {} at {}",
        config.provider,
        config.model,
        config.base_url
    );

    match &config.protocol {
        Protocol::Anthropic => Ok(Arc::new(AnthropicClient::new(config)?)),
        Protocol::OpenAICompat => Ok(Arc::new(OpenAiClient::new(config)?)),
    }
}
