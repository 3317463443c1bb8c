//! Frontend envelope

use super::{Text, ToolResult, TreeUpdate, Update};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A message streamed back to the caller of `Tree::process`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FrontendPayload {
    #[serde(rename = "type")]
    pub payload_type: String,
    pub user_id: String,
    pub conversation_id: String,
    pub query_id: String,
    pub id: String,
    pub payload: Value,
}

impl FrontendPayload {
    pub fn is_completed(&self) -> bool {
        self.payload_type == "completed"
    }

    pub fn is_error(&self) -> bool {
        self.payload_type.ends_with("error")
    }

    /// `payload.text` when present, or the text of the first object
    pub fn text(&self) -> Option<&str> {
        self.payload
            .get("text")
            .and_then(Value::as_str)
            .or_else(|| {
                self.payload
                    .get("objects")
                    .and_then(|objs| objs.get(0))
                    .and_then(|obj| obj.get("text"))
                    .and_then(Value::as_str)
            })
    }
}

/// Stamps ids onto outputs for one query
#[derive(Debug, Clone)]
pub struct FrontendReturner {
    pub user_id: String,
    pub conversation_id: String,
    pub query_id: String,
    pub tree_index: usize,
}

impl FrontendReturner {
    pub fn new<U, C, Q>(user_id: U, conversation_id: C, query_id: Q, tree_index: usize) -> Self
    where
        U: Into<String>,
        C: Into<String>,
        Q: Into<String>,
    {
        Self {
            user_id: user_id.into(),
            conversation_id: conversation_id.into(),
            query_id: query_id.into(),
            tree_index,
        }
    }

    pub fn result(&self, result: &ToolResult) -> Option<FrontendPayload> {
        result.to_frontend(&self.user_id, &self.conversation_id, &self.query_id)
    }

    pub fn text(&self, text: &Text) -> FrontendPayload {
        text.to_frontend(&self.user_id, &self.conversation_id, &self.query_id)
    }

    pub fn update(&self, update: &Update) -> FrontendPayload {
        update.to_frontend(&self.user_id, &self.conversation_id, &self.query_id)
    }

    pub fn tree_update(&self, update: &TreeUpdate, last_in_tree: bool) -> FrontendPayload {
        update.to_frontend(
            &self.user_id,
            &self.conversation_id,
            &self.query_id,
            self.tree_index,
            last_in_tree,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_returner_stamps_ids() {
        let returner = FrontendReturner::new("user", "conv", "query", 0);
        let payload = returner.update(&Update::Completed);
        assert_eq!(payload.user_id, "user");
        assert_eq!(payload.conversation_id, "conv");
        assert_eq!(payload.query_id, "query");
        assert!(payload.is_completed());
        assert!(!payload.is_error());

        let text = returner.text(&Text::response("hi"));
        assert_eq!(text.text(), Some("hi"));
    }

    #[test]
    fn test_serializes_type_field() {
        let returner = FrontendReturner::new("u", "c", "q", 0);
        let payload = returner.update(&Update::error("boom"));
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["type"], "error");
        assert!(payload.is_error());
        assert_eq!(payload.text(), Some("boom"));
    }
}
