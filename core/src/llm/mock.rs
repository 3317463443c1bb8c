//! Scripted client for tests

use super::{ChatOptions, FinishReason, LlmClient, LlmMessage, LlmResponse};
use crate::error::{LlmError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Replies with queued strings in order, then with `fallback` (or an error)
pub struct MockLlmClient {
    replies: Mutex<VecDeque<String>>,
    fallback: Option<String>,
    pub calls: Mutex<Vec<Vec<LlmMessage>>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            fallback: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mock = Self::new();
        mock.replies
            .lock()
            .unwrap()
            .extend(replies.into_iter().map(Into::into));
        mock
    }

    pub fn with_json_replies<I: IntoIterator<Item = Value>>(replies: I) -> Self {
        Self::with_replies(replies.into_iter().map(|v| v.to_string()))
    }

    pub fn with_fallback<S: Into<String>>(mut self, fallback: S) -> Self {
        self.fallback = Some(fallback.into());
        self
    }

    pub fn num_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Concatenated text of every message in call `i`
    pub fn prompt_of(&self, i: usize) -> String {
        self.calls.lock().unwrap()[i]
            .iter()
            .map(|m| m.content.clone())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn chat_completion(
        &self,
        messages: Vec<LlmMessage>,
        _options: Option<ChatOptions>,
    ) -> Result<LlmResponse> {
        self.calls.lock().unwrap().push(messages);
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .or_else(|| self.fallback.clone())
            .ok_or_else(|| LlmError::InvalidRequest {
                message: "mock client has no replies left".to_string(),
            })?;

        Ok(LlmResponse {
            message: LlmMessage::assistant(reply),
            usage: None,
            model: "mock-model".to_string(),
            finish_reason: Some(FinishReason::Stop),
        })
    }

    fn model_name(&self) -> &str {
        "mock-model"
    }

    fn provider_name(&self) -> &str {
        "mock"
    }
}
