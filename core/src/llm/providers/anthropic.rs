//! Anthropic Claude client implementation

use crate::config::ResolvedLlmConfig;
use crate::error::{LlmError, Result};
use crate::llm::{ChatOptions, FinishReason, LlmClient, LlmMessage, LlmResponse, MessageRole, Usage};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

const JSON_INSTRUCTION: &str =
    "Respond with a single JSON object only, with no surrounding text or code fences.";

/// Anthropic Claude client
pub struct AnthropicClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
}

impl AnthropicClient {
    /// Create a new Anthropic client
    pub fn new(config: &ResolvedLlmConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(LlmError::Authentication {
                message: "No API key found for Anthropic".to_string(),
            }
            .into());
        }

        Ok(Self {
            client: Client::new(),
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_tokens: config.params.max_tokens,
            temperature: config.params.temperature,
        })
    }

    fn build_request(&self, messages: Vec<LlmMessage>, options: Option<ChatOptions>) -> AnthropicRequest {
        let options = options.unwrap_or_default();

        // System messages go in their own field
        let mut system_parts = Vec::new();
        let mut conversation = Vec::new();
        for message in messages {
            match message.role {
                MessageRole::System => system_parts.push(message.content),
                _ => conversation.push(message),
            }
        }
        if options.json_output {
            system_parts.push(JSON_INSTRUCTION.to_string());
        }

        AnthropicRequest {
            model: self.model.clone(),
            max_tokens: options.max_tokens.or(self.max_tokens).unwrap_or(4096),
            temperature: options.temperature.or(self.temperature).unwrap_or(0.5),
            system: (!system_parts.is_empty()).then(|| system_parts.join("\n\n")),
            messages: conversation,
        }
    }

    fn convert_response(response: AnthropicResponse) -> LlmResponse {
        let text = response
            .content
            .into_iter()
            .filter(|c| c.content_type == "text")
            .filter_map(|c| c.text)
            .collect::<Vec<_>>()
            .join("");

        let usage = response.usage.map(|u| Usage {
            prompt_tokens: u.input_tokens,
            completion_tokens: u.output_tokens,
            total_tokens: u.input_tokens + u.output_tokens,
        });

        let finish_reason = response.stop_reason.map(|reason| match reason.as_str() {
            "end_turn" | "stop_sequence" => FinishReason::Stop,
            "max_tokens" => FinishReason::Length,
            _ => FinishReason::Other(reason),
        });

        LlmResponse {
            message: LlmMessage::assistant(text),
            usage,
            model: response.model,
            finish_reason,
        }
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn chat_completion(
        &self,
        messages: Vec<LlmMessage>,
        options: Option<ChatOptions>,
    ) -> Result<LlmResponse> {
        let request = self.build_request(messages, options);

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::Network {
                message: e.to_string(),
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(LlmError::RateLimit.into());
        }
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(LlmError::ApiError {
                status: status.as_u16(),
                message: error_text,
            }
            .into());
        }

        let anthropic_response: AnthropicResponse =
            response.json().await.map_err(|e| LlmError::Network {
                message: format!("Failed to parse response: {}", e),
            })?;

        Ok(Self::convert_response(anthropic_response))
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn provider_name(&self) -> &str {
        "anthropic"
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<LlmMessage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    model: String,
    content: Vec<AnthropicContent>,
    stop_reason: Option<String>,
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    #[serde(rename = "type")]
    content_type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}
