//! Mutable state of a conversation

use super::{Atlas, CollectionData, Environment};
use crate::error::Result;
use crate::output::JsonObject;
use crate::weaviate::ClientManager;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Task name under which the decision agent itself records errors
pub const DECISION_NODE_TASK: &str = "grove_decision_node";

/// One `{role, content}` turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: String,
    pub content: String,
}

/// Tasks chosen while answering one prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptTasks {
    pub prompt: String,
    /// Each task is `{task, iteration, ..fields}`
    pub task: Vec<JsonObject>,
}

/// Everything a tree knows about its conversation.
///
/// Created per conversation, mutated by every decision and tool call, and
/// exported as JSON alongside the tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeData {
    pub user_prompt: String,
    pub conversation_history: Vec<ConversationMessage>,
    pub environment: Environment,
    pub tasks_completed: Vec<PromptTasks>,
    pub num_trees_completed: usize,
    pub recursion_limit: usize,
    /// tool name -> error messages
    pub errors: BTreeMap<String, Vec<String>>,
    pub current_task: Option<String>,
    pub atlas: Atlas,
    pub collection_data: CollectionData,
    pub collection_names: Vec<String>,
    /// Reasoning per decision node for the current prompt
    #[serde(default)]
    pub previous_reasoning: BTreeMap<String, String>,
}

impl Default for TreeData {
    fn default() -> Self {
        Self::new(CollectionData::default(), Atlas::default())
    }
}

/// Merge `value` into `task[key]`
fn merge_field(task: &mut JsonObject, key: &str, value: Value) {
    if value.is_null() {
        return;
    }
    let Some(existing) = task.get_mut(key) else {
        task.insert(key.to_string(), value);
        return;
    };

    match (existing, value) {
        (Value::String(old), Value::String(new)) => {
            old.push('\n');
            old.push_str(&new);
        }
        (existing, Value::Number(new)) if existing.is_number() => {
            let sum = match (existing.as_i64(), new.as_i64()) {
                (Some(a), Some(b)) => Value::from(a + b),
                _ => Value::from(existing.as_f64().unwrap_or(0.0) + new.as_f64().unwrap_or(0.0)),
            };
            *existing = sum;
        }
        (Value::Array(old), Value::Array(new)) => old.extend(new),
        (Value::Object(old), Value::Object(new)) => old.extend(new),
        (existing, new) => *existing = new,
    }
}

fn capitalize(key: &str) -> String {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl TreeData {
    pub fn new(collection_data: CollectionData, atlas: Atlas) -> Self {
        Self {
            user_prompt: String::new(),
            conversation_history: Vec::new(),
            environment: Environment::default(),
            tasks_completed: Vec::new(),
            num_trees_completed: 0,
            recursion_limit: 3,
            errors: BTreeMap::new(),
            current_task: None,
            atlas,
            collection_data,
            collection_names: Vec::new(),
            previous_reasoning: BTreeMap::new(),
        }
    }

    pub fn with_recursion_limit(mut self, recursion_limit: usize) -> Self {
        self.recursion_limit = recursion_limit;
        self
    }

    /// Clear per-prompt scratch state
    pub fn soft_reset(&mut self) {
        self.previous_reasoning.clear();
    }

    /// Append a turn; consecutive turns from the same role are joined with a space
    pub fn update_conversation_history(&mut self, role: &str, content: &str) {
        if content.is_empty() {
            return;
        }
        if let Some(last) = self.conversation_history.last_mut() {
            if last.role == role {
                if !last.content.is_empty() && !content.is_empty() {
                    last.content.push(' ');
                }
                last.content.push_str(content);
                return;
            }
        }
        self.conversation_history.push(ConversationMessage {
            role: role.to_string(),
            content: content.to_string(),
        });
    }

    /// Record progress on `task` for `prompt` at `iteration`
    pub fn update_tasks_completed(
        &mut self,
        prompt: &str,
        task: &str,
        iteration: usize,
        fields: JsonObject,
    ) {
        let new_task = |fields: JsonObject| {
            let mut entry = JsonObject::new();
            entry.insert("task".to_string(), Value::String(task.to_string()));
            entry.insert("iteration".to_string(), Value::from(iteration));
            for (key, value) in fields {
                merge_field(&mut entry, &key, value);
            }
            entry
        };

        // A repeated prompt after a different one starts a new entry
        let Some(prompt_entry) = self.tasks_completed.last_mut().filter(|p| p.prompt == prompt) else {
            self.tasks_completed.push(PromptTasks {
                prompt: prompt.to_string(),
                task: vec![new_task(fields)],
            });
            return;
        };

        let existing = prompt_entry.task.iter_mut().find(|t| {
            t.get("task").and_then(Value::as_str) == Some(task)
                && t.get("iteration").and_then(Value::as_u64) == Some(iteration as u64)
        });

        match existing {
            Some(entry) => {
                for (key, value) in fields {
                    merge_field(entry, &key, value);
                }
            }
            None => prompt_entry.task.push(new_task(fields)),
        }
    }

    /// Tasks so far, in the markup the decision agent reads
    pub fn tasks_completed_string(&self) -> String {
        let mut out = String::new();
        for (j, prompt) in self.tasks_completed.iter().enumerate() {
            out.push_str(&format!("<prompt_{}>\n", j + 1));
            out.push_str(&format!("Prompt: {}\n", prompt.prompt));

            for (i, task) in prompt.task.iter().enumerate() {
                out.push_str(&format!("<task_{}>\n", i + 1));
                let name = task.get("task").map(display_value).unwrap_or_default();

                if task.get("action").and_then(Value::as_bool).unwrap_or(false) {
                    out.push_str(&format!(
                        "Chosen action: {} (this does not mean it has been completed, only that it was chosen) \
                         (Use the environment to judge if a task is completed)",
                        name
                    ));
                } else {
                    out.push_str(&format!(
                        "Chosen subcategory: {} (this action has not been completed, this is only a subcategory)",
                        name
                    ));
                }

                if task.get("error").and_then(Value::as_bool).unwrap_or(false) {
                    out.push_str(" (There was an error during this tool call)\n");
                } else {
                    out.push_str(" (Successfully completed)\n");
                }

                for (key, value) in task {
                    if key == "task" || key == "action" {
                        continue;
                    }
                    out.push_str(&format!("{}: {}\n", capitalize(key), display_value(value)));
                }
                out.push_str(&format!("</task_{}>\n", i + 1));
            }
            out.push_str(&format!("</prompt_{}>\n", j + 1));
        }
        out
    }

    /// `"{n+1}/{limit}"` with a warning near and past the limit
    pub fn tree_count_string(&self) -> String {
        let n = self.num_trees_completed;
        let mut out = format!("{}/{}", n + 1, self.recursion_limit);
        if n + 1 == self.recursion_limit {
            out.push_str(" (this is the last decision you can make before being cut off)");
        }
        if n >= self.recursion_limit {
            out.push_str(
                " (recursion limit reached, write your full chat response accordingly - the decision \
                 process has been cut short, and it is likely the user's question has not been fully \
                 answered and you either haven't been able to do it or it was impossible)",
            );
        }
        out
    }

    pub fn set_current_task<S: Into<String>>(&mut self, task: S) {
        self.current_task = Some(task.into());
    }

    /// Errors relevant to the current task; the decision node sees all of them
    pub fn get_errors(&self) -> Value {
        match self.current_task.as_deref() {
            Some(DECISION_NODE_TASK) => serde_json::to_value(&self.errors).unwrap_or(Value::Null),
            Some(task) => Value::from(self.errors.get(task).cloned().unwrap_or_default()),
            None => Value::Array(Vec::new()),
        }
    }

    pub fn add_error<S: Into<String>>(&mut self, task: &str, error: S) {
        self.errors.entry(task.to_string()).or_default().push(error.into());
    }

    pub fn clear_error(&mut self, task: &str) {
        if let Some(errors) = self.errors.get_mut(task) {
            errors.clear();
        }
    }

    /// Resolve and cache the collections this tree may query
    pub async fn set_collection_names(
        &mut self,
        names: &[String],
        client: &ClientManager,
    ) -> Result<Vec<String>> {
        self.collection_names = self.collection_data.set_collection_names(names, client).await?;
        Ok(self.collection_names.clone())
    }

    pub fn output_collection_metadata(&self, with_mappings: bool) -> BTreeMap<String, JsonObject> {
        self.collection_data
            .output_full_metadata(Some(&self.collection_names), with_mappings)
    }

    pub fn output_collection_return_types(&self) -> BTreeMap<String, Vec<String>> {
        self.collection_data
            .output_collection_return_types()
            .into_iter()
            .filter(|(name, _)| self.collection_names.contains(name))
            .collect()
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_json(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}
