//! Resolved model configuration types
//!
//! Core only hands fully resolved, validated configuration to the LLM providers.
//! Provider strings from [`Settings`](super::Settings) are resolved here.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Wire protocols spoken by the providers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    /// OpenAI-compatible API (OpenAI, OpenRouter, Ollama)
    #[serde(rename = "openai_compat")]
    OpenAICompat,
    /// Anthropic Claude API
    #[serde(rename = "anthropic")]
    Anthropic,
}

impl Protocol {
    /// Get the protocol name as a string
    pub fn as_str(&self) -> &str {
        match self {
            Protocol::OpenAICompat => "openai_compat",
            Protocol::Anthropic => "anthropic",
        }
    }

    /// Protocol used by a provider name such as `openai` or `openrouter/google`
    pub fn from_provider(provider: &str) -> Self {
        match provider_root(provider) {
            "anthropic" => Protocol::Anthropic,
            _ => Protocol::OpenAICompat,
        }
    }
}

/// First segment of a provider string: `openrouter/google` -> `openrouter`
pub fn provider_root(provider: &str) -> &str {
    provider.split('/').next().unwrap_or(provider)
}

/// Default API base for a provider, `None` when it must be configured
pub fn default_base_url(provider: &str) -> Option<&'static str> {
    match provider_root(provider) {
        "openai" => Some("https://api.openai.com/v1"),
        "openrouter" => Some("https://openrouter.ai/api/v1"),
        "anthropic" => Some("https://api.anthropic.com"),
        "groq" => Some("https://api.groq.com/openai/v1"),
        "deepseek" => Some("https://api.deepseek.com/v1"),
        _ => None,
    }
}

/// Model parameters for LLM requests
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelParams {
    /// Maximum tokens to generate
    pub max_tokens: Option<u32>,
    /// Temperature for sampling
    pub temperature: Option<f32>,
    /// Top-p sampling parameter
    pub top_p: Option<f32>,
}

impl ModelParams {
    /// Defaults for a model; reasoning models only accept temperature 1.0
    pub fn for_model(model: &str) -> Self {
        let temperature = if model.starts_with("o1") || model.starts_with("o3") {
            Some(1.0)
        } else {
            None
        };
        Self {
            max_tokens: Some(8000),
            temperature,
            top_p: None,
        }
    }
}

/// A fully resolved LLM configuration ready for use by core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedLlmConfig {
    /// Provider string as configured, e.g. `openrouter/google`
    pub provider: String,
    /// The protocol to use
    pub protocol: Protocol,
    /// Base URL for the API
    pub base_url: String,
    /// API key for authentication
    pub api_key: String,
    /// Model name as sent to the API
    pub model: String,
    /// Model parameters
    #[serde(default)]
    pub params: ModelParams,
    /// Additional headers for requests
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl ResolvedLlmConfig {
    pub fn new<P: Into<String>>(
        provider: P,
        protocol: Protocol,
        base_url: String,
        api_key: String,
        model: String,
    ) -> Self {
        Self {
            provider: provider.into(),
            protocol,
            base_url,
            api_key,
            model,
            params: ModelParams::default(),
            headers: HashMap::new(),
        }
    }

    /// Set model parameters
    pub fn with_params(mut self, params: ModelParams) -> Self {
        self.params = params;
        self
    }

    /// Add a header
    pub fn with_header(mut self, key: String, value: String) -> Self {
        self.headers.insert(key, value);
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.api_key.is_empty() {
            return Err(format!("API key for provider '{}' cannot be empty", self.provider));
        }

        if self.model.is_empty() {
            return Err("Model name cannot be empty".to_string());
        }

        if self.base_url.is_empty() {
            return Err("Base URL cannot be empty".to_string());
        }

        if url::Url::parse(&self.base_url).is_err()
            || !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://"))
        {
            return Err("Base URL must start with http:// or https://".to_string());
        }

        if let Some(temp) = self.params.temperature {
            if !(0.0..=2.0).contains(&temp) {
                return Err("Temperature must be between 0.0 and 2.0".to_string());
            }
        }

        if let Some(top_p) = self.params.top_p {
            if !(0.0..=1.0).contains(&top_p) {
                return Err("Top-p must be between 0.0 and 1.0".to_string());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ResolvedLlmConfig {
        ResolvedLlmConfig::new(
            "openai",
            Protocol::OpenAICompat,
            "https://api.openai.com/v1".to_string(),
            "sk-test".to_string(),
            "gpt-4o-mini".to_string(),
        )
    }

    #[test]
    fn test_protocol_from_provider() {
        assert_eq!(Protocol::from_provider("anthropic"), Protocol::Anthropic);
        assert_eq!(Protocol::from_provider("openrouter/google"), Protocol::OpenAICompat);
        assert_eq!(Protocol::from_provider("ollama"), Protocol::OpenAICompat);
        assert_eq!(provider_root("openrouter/google"), "openrouter");
        assert_eq!(default_base_url("ollama"), None);
    }

    #[test]
    fn test_validate() {
        assert!(valid().validate().is_ok());

        let mut config = valid();
        config.api_key.clear();
        assert!(config.validate().is_err());

        let mut config = valid();
        config.base_url = "ftp://example.com".to_string();
        assert!(config.validate().is_err());

        let config = valid().with_params(ModelParams {
            temperature: Some(3.0),
            ..Default::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reasoning_model_params() {
        assert_eq!(ModelParams::for_model("o3-mini").temperature, Some(1.0));
        assert_eq!(ModelParams::for_model("gpt-4o").temperature, None);
        assert_eq!(ModelParams::for_model("gpt-4o").max_tokens, Some(8000));
    }
}
