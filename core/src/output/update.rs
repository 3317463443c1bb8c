//! Status messages and tree-navigation updates

use super::{frontend_id, FrontendPayload};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Frontend-only messages; none of these enter the environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Update {
    /// Progress text, e.g. "Querying collection..."
    Status { text: String },
    Warning { text: String },
    /// A tool failure the decision agent should see on its next step
    Error { text: String },
    Completed,
    TreeTimeoutError,
    UserTimeoutError,
    RateLimitError { reset_time: DateTime<Utc> },
}

impl Update {
    pub fn status<S: Into<String>>(text: S) -> Self {
        Update::Status { text: text.into() }
    }

    pub fn warning<S: Into<String>>(text: S) -> Self {
        Update::Warning { text: text.into() }
    }

    pub fn error<S: Into<String>>(text: S) -> Self {
        Update::Error { text: text.into() }
    }

    /// Envelope `type` for this update
    pub fn frontend_type(&self) -> &'static str {
        match self {
            Update::Status { .. } => "status",
            Update::Warning { .. } => "warning",
            Update::Error { .. } => "error",
            Update::Completed => "completed",
            Update::TreeTimeoutError => "tree_timeout_error",
            Update::UserTimeoutError => "user_timeout_error",
            Update::RateLimitError { .. } => "rate_limit_error",
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            Update::Status { text } | Update::Warning { text } | Update::Error { text } => {
                json!({ "text": text })
            }
            Update::Completed => json!({}),
            Update::TreeTimeoutError => json!({
                "text": "This conversation has been timed out due to inactivity. Please start a new conversation."
            }),
            Update::UserTimeoutError => json!({
                "text": "You have been timed out due to inactivity. Please start a new conversation."
            }),
            Update::RateLimitError { reset_time } => {
                let left = (*reset_time - Utc::now()).num_seconds().max(0);
                json!({
                    "text": "You have exceeded the maximum number of requests per day. Please try again tomorrow!",
                    "reset_time": reset_time.to_rfc3339(),
                    "time_left": {
                        "hours": left / 3600,
                        "minutes": (left % 3600) / 60,
                        "seconds": left % 60,
                    }
                })
            }
        }
    }

    pub fn to_frontend(
        &self,
        user_id: &str,
        conversation_id: &str,
        query_id: &str,
    ) -> FrontendPayload {
        let frontend_type = self.frontend_type();
        FrontendPayload {
            payload_type: frontend_type.to_string(),
            user_id: user_id.to_string(),
            conversation_id: conversation_id.to_string(),
            query_id: query_id.to_string(),
            id: frontend_id(frontend_type),
            payload: self.payload(),
        }
    }
}

/// Movement of the decision agent from one node to another
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeUpdate {
    pub from_node: String,
    pub to_node: String,
    pub reasoning: String,
    pub last_in_branch: bool,
}

impl TreeUpdate {
    pub fn new<F, T, R>(from_node: F, to_node: T, reasoning: R, last_in_branch: bool) -> Self
    where
        F: Into<String>,
        T: Into<String>,
        R: Into<String>,
    {
        Self {
            from_node: from_node.into(),
            to_node: to_node.into(),
            reasoning: reasoning.into(),
            last_in_branch,
        }
    }

    /// `reset` is only set when this is the final move of the whole tree
    pub fn to_frontend(
        &self,
        user_id: &str,
        conversation_id: &str,
        query_id: &str,
        tree_index: usize,
        last_in_tree: bool,
    ) -> FrontendPayload {
        FrontendPayload {
            payload_type: "tree_update".to_string(),
            user_id: user_id.to_string(),
            conversation_id: conversation_id.to_string(),
            query_id: query_id.to_string(),
            id: frontend_id("tree_update"),
            payload: json!({
                "node": self.from_node,
                "tree_index": tree_index,
                "decision": self.to_node,
                "reasoning": self.reasoning,
                "reset": last_in_tree && self.last_in_branch,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_status_envelope() {
        let frontend = Update::status("Searching...").to_frontend("u", "c", "q");
        assert_eq!(frontend.payload_type, "status");
        assert!(frontend.id.starts_with("sta-"));
        assert_eq!(frontend.user_id, "u");
        assert_eq!(frontend.payload["text"], "Searching...");
    }

    #[test]
    fn test_timeout_texts() {
        let tree = Update::TreeTimeoutError.payload();
        assert!(tree["text"].as_str().unwrap().contains("conversation has been timed out"));

        let user = Update::UserTimeoutError.payload();
        assert!(user["text"].as_str().unwrap().starts_with("You have been timed out"));
    }

    #[test]
    fn test_rate_limit_time_left() {
        let reset_time = Utc::now() + Duration::hours(2) + Duration::minutes(30);
        let payload = Update::RateLimitError { reset_time }.payload();
        let hours = payload["time_left"]["hours"].as_i64().unwrap();
        let minutes = payload["time_left"]["minutes"].as_i64().unwrap();
        assert_eq!(hours, 2);
        assert!(minutes == 29 || minutes == 30);
    }

    #[test]
    fn test_tree_update_reset() {
        let update = TreeUpdate::new("base", "search", "need data", true);
        let last = update.to_frontend("u", "c", "q", 2, true);
        assert_eq!(last.payload_type, "tree_update");
        assert_eq!(last.payload["node"], "base");
        assert_eq!(last.payload["decision"], "search");
        assert_eq!(last.payload["tree_index"], 2);
        assert_eq!(last.payload["reset"], true);

        let not_last = update.to_frontend("u", "c", "q", 2, false);
        assert_eq!(not_last.payload["reset"], false);
    }
}
