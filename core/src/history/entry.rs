//! History entry for one answered query

use crate::output::JsonObject;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What the tree did to answer one user prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryHistory {
    pub query_id: String,
    pub user_prompt: String,
    pub num_trees_completed: usize,
    /// Snapshot of the tree data; omitted for low-memory trees
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tree_data: Option<Value>,
    #[serde(default)]
    pub action_information: Vec<JsonObject>,
    #[serde(default)]
    pub decision_history: Vec<String>,
    pub base_lm_used: String,
    pub complex_lm_used: String,
    pub time_taken_seconds: f64,
    /// Branch initialisation the tree ran with
    pub initialisation: String,
    pub recorded_at: DateTime<Utc>,
}

impl QueryHistory {
    /// Tools run, in order, without the branch choices
    pub fn tools_used<'a>(&'a self, tool_names: &'a [String]) -> impl Iterator<Item = &'a str> {
        self.decision_history
            .iter()
            .filter(move |name| tool_names.contains(name))
            .map(String::as_str)
    }
}
