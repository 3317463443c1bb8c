//! Shared store of every object produced during a conversation

use crate::output::{JsonObject, ToolResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Tool key holding the assistant's own description
pub const SELF_INFO: &str = "SelfInfo";

const REF_ID: &str = "_REF_ID";

/// One batch of objects with the metadata they were produced under
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentEntry {
    #[serde(default)]
    pub metadata: JsonObject,
    #[serde(default)]
    pub objects: Vec<JsonObject>,
}

/// `tool_name -> result name -> [entries]`
pub type EnvironmentMap = BTreeMap<String, BTreeMap<String, Vec<EnvironmentEntry>>>;

/// Objects accumulated across a conversation.
///
/// Every object added gets a `_REF_ID` of the form `{tool}_{name}_{n}_{i}` so the
/// decision agent and tools can point back at it. Objects already present under
/// the same tool and name are stored as `[repeat]` markers instead of a second copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub environment: EnvironmentMap,
    /// Never shown to the LLM; shared scratch space for tools
    #[serde(default)]
    pub hidden_environment: JsonObject,
    #[serde(default)]
    pub self_info: bool,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new(true)
    }
}

fn self_info_record() -> JsonObject {
    let mut info = JsonObject::new();
    info.insert("name".into(), Value::String("Grove".into()));
    info.insert(
        "description".into(),
        Value::String("An agentic decision-tree assistant over vector database collections.".into()),
    );
    info.insert(
        "purpose".into(),
        Value::String(
            "Grove answers questions by walking a tree of decisions. At each node a decision \
             agent picks a tool or a sub-branch; tools query collections, aggregate data, \
             summarise or reply in text. Everything tools retrieve is stored in this environment \
             and shown to later decisions, so retrieved objects can be reused instead of fetched \
             again."
                .into(),
        ),
    );
    info
}

/// Resolve a possibly negative index against `len`
fn resolve_index(index: isize, len: usize) -> Option<usize> {
    let resolved = if index < 0 {
        len.checked_sub(index.unsigned_abs())?
    } else {
        index as usize
    };
    (resolved < len).then_some(resolved)
}

fn without_ref_id(obj: &JsonObject) -> impl Iterator<Item = (&String, &Value)> {
    obj.iter().filter(|(k, _)| k.as_str() != REF_ID)
}

fn same_object(a: &JsonObject, b: &JsonObject) -> bool {
    a.keys().filter(|k| k.as_str() != REF_ID).count() == b.keys().filter(|k| k.as_str() != REF_ID).count()
        && without_ref_id(a).all(|(k, v)| b.get(k) == Some(v))
}

impl Environment {
    pub fn new(self_info: bool) -> Self {
        let mut environment = EnvironmentMap::new();
        if self_info {
            environment.entry(SELF_INFO.to_string()).or_default().insert(
                "info".to_string(),
                vec![EnvironmentEntry {
                    metadata: JsonObject::new(),
                    objects: vec![self_info_record()],
                }],
            );
        }
        Self {
            environment,
            hidden_environment: JsonObject::new(),
            self_info,
        }
    }

    /// True when nothing but `SelfInfo` (or emptied lists) is stored
    pub fn is_empty(&self) -> bool {
        self.environment
            .iter()
            .filter(|(tool, _)| tool.as_str() != SELF_INFO)
            .all(|(_, results)| results.values().all(Vec::is_empty))
    }

    /// Add a tool result under `tool_name -> result.name`
    pub fn add(&mut self, tool_name: &str, result: &ToolResult, include_duplicates: bool) {
        self.add_objects(
            tool_name,
            &result.name,
            result.to_json(false),
            result.metadata.clone(),
            include_duplicates,
        );
    }

    pub fn add_objects(
        &mut self,
        tool_name: &str,
        name: &str,
        objects: Vec<JsonObject>,
        metadata: JsonObject,
        include_duplicates: bool,
    ) {
        let tool_name_owned = tool_name.to_string();
        let entries = self
            .environment
            .entry(tool_name_owned)
            .or_default()
            .entry(name.to_string())
            .or_default();

        if objects.is_empty() {
            return;
        }

        entries.push(EnvironmentEntry {
            metadata,
            objects: Vec::with_capacity(objects.len()),
        });
        let n = entries.len();

        for (i, obj) in objects.into_iter().enumerate() {
            let existing_ref = entries.iter().find_map(|entry| {
                entry
                    .objects
                    .iter()
                    .find(|stored| stored.get("object_info").is_none() && same_object(stored, &obj))
                    .and_then(|stored| stored.get(REF_ID).cloned())
            });

            let stored = match existing_ref {
                Some(ref_id) if !include_duplicates => {
                    let mut marker = JsonObject::new();
                    marker.insert("object_info".to_string(), Value::String("[repeat]".to_string()));
                    marker.insert(REF_ID.to_string(), ref_id);
                    marker
                }
                _ if !obj.contains_key(REF_ID) => {
                    let mut with_ref = JsonObject::new();
                    with_ref.insert(
                        REF_ID.to_string(),
                        Value::String(format!("{}_{}_{}_{}", tool_name, name, n, i)),
                    );
                    with_ref.extend(obj);
                    with_ref
                }
                _ => obj,
            };

            if let Some(last) = entries.last_mut() {
                last.objects.push(stored);
            }
        }
    }

    /// Empty the list (`index = None`) or pop one entry; `-1` is the last entry
    pub fn remove(&mut self, tool_name: &str, name: &str, index: Option<isize>) -> Option<EnvironmentEntry> {
        let entries = self.environment.get_mut(tool_name)?.get_mut(name)?;
        match index {
            None => {
                entries.clear();
                None
            }
            Some(index) => {
                let i = resolve_index(index, entries.len())?;
                Some(entries.remove(i))
            }
        }
    }

    /// Overwrite the whole list (`index = None`) or one entry
    pub fn replace(
        &mut self,
        tool_name: &str,
        name: &str,
        objects: Vec<JsonObject>,
        metadata: JsonObject,
        index: Option<isize>,
    ) {
        let Some(entries) = self
            .environment
            .get_mut(tool_name)
            .and_then(|results| results.get_mut(name))
        else {
            return;
        };

        let entry = EnvironmentEntry { metadata, objects };
        match index {
            None => *entries = vec![entry],
            Some(index) => {
                if let Some(i) = resolve_index(index, entries.len()) {
                    entries[i] = entry;
                }
            }
        }
    }

    /// All entries under `tool_name -> name`
    pub fn find(&self, tool_name: &str, name: &str) -> Option<&Vec<EnvironmentEntry>> {
        self.environment.get(tool_name)?.get(name)
    }

    /// One entry under `tool_name -> name`
    pub fn find_entry(&self, tool_name: &str, name: &str, index: isize) -> Option<&EnvironmentEntry> {
        let entries = self.find(tool_name, name)?;
        resolve_index(index, entries.len()).map(|i| &entries[i])
    }

    /// The visible environment as JSON, for prompts
    pub fn llm_view(&self) -> Value {
        serde_json::to_value(&self.environment).unwrap_or(Value::Null)
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_json(value: Value) -> crate::error::Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> JsonObject {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_self_info_not_counted() {
        let env = Environment::new(true);
        assert!(env.is_empty());
        assert!(env.find(SELF_INFO, "info").is_some());

        let env = Environment::new(false);
        assert!(env.find(SELF_INFO, "info").is_none());
    }

    #[test]
    fn test_lazy_keys_and_empty_objects() {
        let mut env = Environment::new(false);
        env.add_objects("query", "articles", vec![], JsonObject::new(), false);

        assert_eq!(env.find("query", "articles").unwrap().len(), 0);
        assert!(env.is_empty());
    }

    #[test]
    fn test_ref_ids() {
        let mut env = Environment::new(false);
        env.add_objects(
            "query",
            "articles",
            vec![obj(json!({"title": "a"})), obj(json!({"title": "b"}))],
            obj(json!({"query": "q1"})),
            false,
        );
        env.add_objects(
            "query",
            "articles",
            vec![obj(json!({"title": "c"})), obj(json!({"title": "d", "_REF_ID": "mine"}))],
            JsonObject::new(),
            false,
        );

        let entries = env.find("query", "articles").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].metadata["query"], "q1");
        assert_eq!(entries[0].objects[0]["_REF_ID"], "query_articles_1_0");
        assert_eq!(entries[0].objects[1]["_REF_ID"], "query_articles_1_1");
        assert_eq!(entries[1].objects[0]["_REF_ID"], "query_articles_2_0");
        assert_eq!(entries[1].objects[1]["_REF_ID"], "mine");
        assert!(!env.is_empty());
    }

    #[test]
    fn test_duplicates_become_markers() {
        let mut env = Environment::new(false);
        env.add_objects("query", "c", vec![obj(json!({"x": 1}))], JsonObject::new(), false);
        env.add_objects(
            "query",
            "c",
            vec![obj(json!({"x": 1})), obj(json!({"x": 2}))],
            JsonObject::new(),
            false,
        );

        let second = &env.find("query", "c").unwrap()[1];
        assert_eq!(
            second.objects[0],
            obj(json!({"object_info": "[repeat]", "_REF_ID": "query_c_1_0"}))
        );
        assert_eq!(second.objects[1]["x"], 2);

        // with duplicates allowed, the object is stored again with a fresh ref
        env.add_objects("query", "c", vec![obj(json!({"x": 1}))], JsonObject::new(), true);
        let third = &env.find("query", "c").unwrap()[2];
        assert_eq!(third.objects[0]["x"], 1);
        assert_eq!(third.objects[0]["_REF_ID"], "query_c_3_0");
    }

    #[test]
    fn test_duplicates_are_scoped_per_name() {
        let mut env = Environment::new(false);
        env.add_objects("query", "a", vec![obj(json!({"x": 1}))], JsonObject::new(), false);
        env.add_objects("query", "b", vec![obj(json!({"x": 1}))], JsonObject::new(), false);
        assert_eq!(env.find("query", "b").unwrap()[0].objects[0]["x"], 1);
    }

    #[test]
    fn test_remove() {
        let mut env = Environment::new(false);
        for i in 0..3 {
            env.add_objects("t", "n", vec![obj(json!({ "i": i }))], JsonObject::new(), false);
        }

        let popped = env.remove("t", "n", Some(-1)).unwrap();
        assert_eq!(popped.objects[0]["i"], 2);
        let popped = env.remove("t", "n", Some(0)).unwrap();
        assert_eq!(popped.objects[0]["i"], 0);
        assert_eq!(env.find("t", "n").unwrap().len(), 1);

        env.remove("t", "n", None);
        assert!(env.find("t", "n").unwrap().is_empty());
        assert!(env.is_empty());

        // missing keys are a no-op
        assert!(env.remove("missing", "n", None).is_none());
        assert!(env.remove("t", "n", Some(5)).is_none());
    }

    #[test]
    fn test_replace_and_find() {
        let mut env = Environment::new(false);
        env.add_objects("t", "n", vec![obj(json!({"a": 1}))], JsonObject::new(), false);
        env.add_objects("t", "n", vec![obj(json!({"a": 2}))], JsonObject::new(), false);

        env.replace("t", "n", vec![obj(json!({"b": 1}))], obj(json!({"m": true})), Some(1));
        assert_eq!(env.find_entry("t", "n", 1).unwrap().objects[0]["b"], 1);
        assert_eq!(env.find_entry("t", "n", -1).unwrap().metadata["m"], true);

        env.replace("t", "n", vec![obj(json!({"c": 1}))], JsonObject::new(), None);
        assert_eq!(env.find("t", "n").unwrap().len(), 1);

        env.replace("missing", "n", vec![], JsonObject::new(), None);
        assert!(env.find("missing", "n").is_none());
        assert!(env.find_entry("t", "n", 3).is_none());
    }

    #[test]
    fn test_json_shape() {
        let mut env = Environment::new(true);
        env.hidden_environment.insert("k".to_string(), json!("v"));
        env.add_objects("t", "n", vec![obj(json!({"a": 1}))], JsonObject::new(), false);

        let value = env.to_json();
        assert!(value["environment"]["t"]["n"].is_array());
        assert_eq!(value["hidden_environment"]["k"], "v");
        assert_eq!(value["self_info"], true);

        let restored = Environment::from_json(value).unwrap();
        assert_eq!(restored, env);
    }

    #[test]
    fn test_add_result_uses_name() {
        let mut env = Environment::new(false);
        let result = crate::output::ToolResult::table(vec![obj(json!({"a": 1}))]).with_name("weather");
        env.add("forecast", &result, false);
        assert_eq!(env.find("forecast", "weather").unwrap()[0].objects.len(), 1);
    }
}
