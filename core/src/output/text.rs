//! Assistant speech yielded by tools

use super::{frontend_id, FrontendPayload, JsonObject};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Text shown to the user and appended to the conversation history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Text {
    /// `response`, `summary` or a custom text type
    pub text_type: String,
    pub objects: Vec<JsonObject>,
    #[serde(default)]
    pub metadata: JsonObject,
}

impl Text {
    pub fn new<S: Into<String>>(text_type: S, objects: Vec<JsonObject>) -> Self {
        Self {
            text_type: text_type.into(),
            objects,
            metadata: JsonObject::new(),
        }
    }

    /// A plain chat response
    pub fn response<S: Into<String>>(text: S) -> Self {
        let mut obj = JsonObject::new();
        obj.insert("text".to_string(), Value::String(text.into()));
        Self::new("response", vec![obj])
    }

    /// A titled summary
    pub fn summary<S: Into<String>, T: Into<String>>(text: S, title: T) -> Self {
        let mut obj = JsonObject::new();
        obj.insert("text".to_string(), Value::String(text.into()));
        obj.insert("title".to_string(), Value::String(title.into()));
        Self::new("summary", vec![obj])
    }

    pub fn with_metadata(mut self, metadata: JsonObject) -> Self {
        self.metadata = metadata;
        self
    }

    /// Concatenated text of every object, as it enters the conversation history
    pub fn content(&self) -> String {
        self.objects
            .iter()
            .filter_map(|obj| obj.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn to_frontend(
        &self,
        user_id: &str,
        conversation_id: &str,
        query_id: &str,
    ) -> FrontendPayload {
        FrontendPayload {
            payload_type: "text".to_string(),
            user_id: user_id.to_string(),
            conversation_id: conversation_id.to_string(),
            query_id: query_id.to_string(),
            id: frontend_id("text"),
            payload: json!({
                "type": self.text_type,
                "metadata": self.metadata,
                "objects": self.objects,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response() {
        let text = Text::response("hello there");
        assert_eq!(text.text_type, "response");
        assert_eq!(text.content(), "hello there");

        let frontend = text.to_frontend("u", "c", "q");
        assert_eq!(frontend.payload_type, "text");
        assert!(frontend.id.starts_with("tex-"));
        assert_eq!(frontend.payload["type"], "response");
        assert_eq!(frontend.payload["objects"][0]["text"], "hello there");
    }

    #[test]
    fn test_summary() {
        let text = Text::summary("the body", "The Title");
        assert_eq!(text.text_type, "summary");
        assert_eq!(text.objects[0]["title"], "The Title");
        assert_eq!(text.content(), "the body");
    }
}
