//! OpenAI-compatible client using the async-openai library
//!
//! Serves OpenAI itself, OpenRouter and local Ollama servers, which all speak
//! the same chat-completions protocol.

use crate::config::ResolvedLlmConfig;
use crate::error::{LlmError, Result};
use crate::llm::{ChatOptions, FinishReason, LlmClient, LlmMessage, LlmResponse, MessageRole, Usage};
use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionRequestAssistantMessage, ChatCompletionRequestAssistantMessageContent,
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
        ChatCompletionRequestUserMessage, CreateChatCompletionRequestArgs, ResponseFormat,
    },
    Client,
};
use async_trait::async_trait;

/// OpenAI-compatible chat client
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    provider: String,
}

impl OpenAiClient {
    /// Create a new client from resolved LLM config
    pub fn new(config: &ResolvedLlmConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(LlmError::Authentication {
                message: format!("No API key found for {}", config.provider),
            }
            .into());
        }

        let openai_config = OpenAIConfig::new()
            .with_api_key(&config.api_key)
            .with_api_base(config.base_url.trim_end_matches('/'));

        Ok(Self {
            client: Client::with_config(openai_config),
            model: config.model.clone(),
            provider: config.provider.clone(),
        })
    }

    fn convert_messages(messages: Vec<LlmMessage>) -> Vec<ChatCompletionRequestMessage> {
        messages
            .into_iter()
            .map(|message| match message.role {
                MessageRole::System => {
                    ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessage {
                        content: message.content.into(),
                        name: None,
                    })
                }
                MessageRole::User => {
                    ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
                        content: message.content.into(),
                        name: None,
                    })
                }
                MessageRole::Assistant => ChatCompletionRequestMessage::Assistant(
                    ChatCompletionRequestAssistantMessage {
                        content: Some(ChatCompletionRequestAssistantMessageContent::Text(
                            message.content,
                        )),
                        ..Default::default()
                    },
                ),
            })
            .collect()
    }

    fn convert_response(
        response: async_openai::types::CreateChatCompletionResponse,
    ) -> Result<LlmResponse> {
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidOutput {
                message: "No choices in response".to_string(),
            })?;

        let usage = response.usage.map(|u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });

        let finish_reason = choice.finish_reason.map(|reason| match reason {
            async_openai::types::FinishReason::Stop => FinishReason::Stop,
            async_openai::types::FinishReason::Length => FinishReason::Length,
            async_openai::types::FinishReason::ContentFilter => FinishReason::ContentFilter,
            other => FinishReason::Other(format!("{:?}", other)),
        });

        Ok(LlmResponse {
            message: LlmMessage::assistant(choice.message.content.unwrap_or_default()),
            usage,
            model: response.model,
            finish_reason,
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn chat_completion(
        &self,
        messages: Vec<LlmMessage>,
        options: Option<ChatOptions>,
    ) -> Result<LlmResponse> {
        let mut request_builder = CreateChatCompletionRequestArgs::default();
        request_builder.model(&self.model);
        request_builder.messages(Self::convert_messages(messages));

        if let Some(opts) = options {
            if let Some(max_tokens) = opts.max_tokens {
                request_builder.max_tokens(max_tokens);
            }
            if let Some(temperature) = opts.temperature {
                request_builder.temperature(temperature);
            }
            if let Some(top_p) = opts.top_p {
                request_builder.top_p(top_p);
            }
            if opts.json_output {
                request_builder.response_format(ResponseFormat::JsonObject);
            }
        }

        let request = request_builder.build().map_err(|e| {
            tracing::error!("Failed to build {} request: {}", self.provider, e);
            LlmError::InvalidRequest {
                message: format!("Failed to build request: {}", e),
            }
        })?;

        let response = self.client.chat().create(request).await.map_err(|e| {
            tracing::error!("{} API call failed: {}", self.provider, e);
            match e {
                OpenAIError::Reqwest(err) => LlmError::Network {
                    message: err.to_string(),
                },
                // async-openai doesn't expose status codes directly
                other => LlmError::ApiError {
                    status: 500,
                    message: other.to_string(),
                },
            }
        })?;

        Self::convert_response(response)
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn provider_name(&self) -> &str {
        &self.provider
    }
}
