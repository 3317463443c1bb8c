//! Pulling JSON objects out of model replies

use crate::error::{LlmError, Result};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// Parse the JSON object in a reply.
///
/// Accepts a bare object, an object inside a ```json fence, or an object
/// surrounded by prose.
pub fn extract_json(text: &str) -> Result<Value> {
    let trimmed = text.trim();
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }

    static FENCE: OnceLock<Regex> = OnceLock::new();
    let fence = FENCE.get_or_init(|| {
        Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").unwrap_or_else(|_| unreachable!())
    });
    if let Some(caps) = fence.captures(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(&caps[1]) {
            return Ok(value);
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            if let Ok(value) = serde_json::from_str::<Value>(&trimmed[start..=end]) {
                return Ok(value);
            }
        }
    }

    Err(LlmError::InvalidOutput {
        message: format!("no JSON object found in reply: {}", trimmed),
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_object() {
        let value = extract_json(r#"{"function_name": "text_response"}"#).unwrap();
        assert_eq!(value["function_name"], "text_response");
    }

    #[test]
    fn test_fenced_object() {
        let reply = "Here you go:\n```json\n{\"a\": 1}\n```\nDone.";
        assert_eq!(extract_json(reply).unwrap()["a"], 1);
    }

    #[test]
    fn test_object_in_prose() {
        let reply = "I think {\"a\": {\"b\": 2}} is right";
        assert_eq!(extract_json(reply).unwrap()["a"]["b"], 2);
    }

    #[test]
    fn test_no_object() {
        assert!(extract_json("no json here").is_err());
        assert!(extract_json("[1, 2]").is_err());
    }
}
