//! LLM client abstractions and implementations

pub mod client;
pub mod json;
pub mod message;
pub mod providers;
pub mod timer;

#[cfg(test)]
pub(crate) mod mock;

pub use client::{complete_json, ChatOptions, FinishReason, LlmClient, LlmResponse, Usage};
pub use json::extract_json;
pub use message::{LlmMessage, MessageRole};
pub use providers::*;
pub use timer::{LmTimer, TimedLlmClient};
