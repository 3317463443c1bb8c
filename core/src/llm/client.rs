//! LLM client trait and response structures

use crate::error::{LlmError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::message::LlmMessage;

/// A chat model the tree and its tools can call
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat_completion(
        &self,
        messages: Vec<LlmMessage>,
        options: Option<ChatOptions>,
    ) -> Result<LlmResponse>;

    fn model_name(&self) -> &str;

    /// Provider as written in the settings, e.g. `openrouter/google`
    fn provider_name(&self) -> &str;
}

/// Ask for a JSON object and deserialize it into `T`
pub async fn complete_json<T: DeserializeOwned>(
    client: &dyn LlmClient,
    messages: Vec<LlmMessage>,
    options: Option<ChatOptions>,
) -> Result<T> {
    let options = options.unwrap_or_default().json();
    let response = client.chat_completion(messages, Some(options)).await?;
    let value = super::extract_json(response.message.get_text())?;

    serde_json::from_value(value).map_err(|e| {
        LlmError::InvalidOutput {
            message: format!("{} ({})", e, response.message.get_text()),
        }
        .into()
    })
}

/// One completed reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub message: LlmMessage,
    pub usage: Option<Usage>,
    /// Model that actually answered, as reported by the provider
    pub model: String,
    pub finish_reason: Option<FinishReason>,
}

/// Token counts reported by the provider
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    /// Cut off by `max_tokens`
    Length,
    ContentFilter,
    Other(String),
}

/// Sampling options for one request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    /// Ask the provider for a bare JSON object
    #[serde(default)]
    pub json_output: bool,
}

impl ChatOptions {
    pub fn json(mut self) -> Self {
        self.json_output = true;
        self
    }
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            max_tokens: Some(8192),
            temperature: None,
            top_p: None,
            json_output: false,
        }
    }
}
