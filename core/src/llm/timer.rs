//! Call timing for LLM clients

use super::{ChatOptions, LlmClient, LlmMessage, LlmResponse};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Running record of how long LLM calls took
#[derive(Debug, Default)]
pub struct LmTimer {
    name: String,
    durations: Mutex<Vec<Duration>>,
}

impl LmTimer {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            durations: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn record(&self, elapsed: Duration) {
        if let Ok(mut durations) = self.durations.lock() {
            durations.push(elapsed);
        }
    }

    pub fn num_calls(&self) -> usize {
        self.durations.lock().map(|d| d.len()).unwrap_or(0)
    }

    /// Mean call time, zero before any call
    pub fn avg(&self) -> Duration {
        let Ok(durations) = self.durations.lock() else {
            return Duration::ZERO;
        };
        if durations.is_empty() {
            return Duration::ZERO;
        }
        durations.iter().sum::<Duration>() / durations.len() as u32
    }

    pub fn total(&self) -> Duration {
        self.durations
            .lock()
            .map(|d| d.iter().sum())
            .unwrap_or(Duration::ZERO)
    }
}

/// Wraps a client and records every call into an [`LmTimer`]
pub struct TimedLlmClient {
    inner: Arc<dyn LlmClient>,
    timer: Arc<LmTimer>,
}

impl TimedLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, timer: Arc<LmTimer>) -> Self {
        Self { inner, timer }
    }
}

#[async_trait]
impl LlmClient for TimedLlmClient {
    async fn chat_completion(
        &self,
        messages: Vec<LlmMessage>,
        options: Option<ChatOptions>,
    ) -> Result<LlmResponse> {
        let start = Instant::now();
        let response = self.inner.chat_completion(messages, options).await;
        let elapsed = start.elapsed();
        self.timer.record(elapsed);
        tracing::debug!(
            "{} call to {} took {:.2}s",
            self.timer.name(),
            self.inner.model_name(),
            elapsed.as_secs_f64()
        );
        response
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn provider_name(&self) -> &str {
        self.inner.provider_name()
    }
}
