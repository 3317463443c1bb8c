//! Displayed results returned by tools

use super::{frontend_id, FrontendPayload, JsonObject};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Frontend display kind of a result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    /// Anything that does not fit the other kinds, shown as a table
    Table,
    /// title / subtitle / content / url / author / tags ...
    Generic,
    /// Long-form text with a title and content
    Document,
    /// Issue trackers, support tickets
    Ticket,
    /// Products
    Ecommerce,
    /// A single chat message
    Message,
    /// A chain of messages
    Conversation,
    /// Output of an aggregation over a collection
    Aggregation,
    /// User-defined display kind
    #[serde(untagged)]
    Custom(String),
}

impl ResultKind {
    /// Payload type name
    pub fn as_str(&self) -> &str {
        match self {
            ResultKind::Table => "table",
            ResultKind::Generic => "generic",
            ResultKind::Document => "document",
            ResultKind::Ticket => "ticket",
            ResultKind::Ecommerce => "ecommerce",
            ResultKind::Message => "message",
            ResultKind::Conversation => "conversation",
            ResultKind::Aggregation => "aggregation",
            ResultKind::Custom(name) => name,
        }
    }

    /// Parse a display type as chosen by a model; unknown names become `Custom`
    pub fn from_name(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "table" => ResultKind::Table,
            "generic" => ResultKind::Generic,
            "document" => ResultKind::Document,
            "ticket" => ResultKind::Ticket,
            "ecommerce" => ResultKind::Ecommerce,
            "message" => ResultKind::Message,
            "conversation" => ResultKind::Conversation,
            "aggregation" => ResultKind::Aggregation,
            other => ResultKind::Custom(other.to_string()),
        }
    }
}

/// A set of objects returned by a tool.
///
/// Results are displayed to the user and added to the environment under
/// `tool_name -> name`. `llm_parse` is what the decision agent reads back in the
/// tasks-completed log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub objects: Vec<JsonObject>,
    #[serde(default)]
    pub metadata: JsonObject,
    pub kind: ResultKind,
    pub name: String,
    /// frontend key -> object key
    #[serde(default)]
    pub mapping: Option<BTreeMap<String, String>>,
    /// Template with `{type}`, `{name}`, `{num_objects}` and `{<metadata key>}` placeholders
    #[serde(default)]
    pub llm_message: Option<String>,
    /// Keys copied through verbatim when a mapping is applied
    #[serde(default)]
    pub unmapped_keys: Vec<String>,
    /// Whether this came from querying a collection
    #[serde(default)]
    pub retrieval: bool,
}

impl ToolResult {
    /// Create a new result of the given kind
    pub fn new(kind: ResultKind, objects: Vec<JsonObject>) -> Self {
        Self {
            objects,
            metadata: JsonObject::new(),
            kind,
            name: "default".to_string(),
            mapping: None,
            llm_message: None,
            unmapped_keys: vec!["_REF_ID".to_string()],
            retrieval: false,
        }
    }

    pub fn table(objects: Vec<JsonObject>) -> Self {
        Self::new(ResultKind::Table, objects)
    }

    pub fn generic(objects: Vec<JsonObject>) -> Self {
        Self::new(ResultKind::Generic, objects)
    }

    pub fn document(objects: Vec<JsonObject>) -> Self {
        Self::new(ResultKind::Document, objects)
    }

    pub fn ticket(objects: Vec<JsonObject>) -> Self {
        Self::new(ResultKind::Ticket, objects)
    }

    pub fn ecommerce(objects: Vec<JsonObject>) -> Self {
        Self::new(ResultKind::Ecommerce, objects)
    }

    pub fn message(objects: Vec<JsonObject>) -> Self {
        Self::new(ResultKind::Message, objects)
    }

    pub fn conversation(objects: Vec<JsonObject>) -> Self {
        Self::new(ResultKind::Conversation, objects)
    }

    /// Objects retrieved from a collection.
    ///
    /// The result is named after `metadata.collection_name` when present.
    pub fn retrieval(kind: ResultKind, objects: Vec<JsonObject>, metadata: JsonObject) -> Self {
        let name = metadata
            .get("collection_name")
            .and_then(Value::as_str)
            .unwrap_or("default")
            .to_string();

        Self {
            objects,
            metadata,
            kind,
            name,
            mapping: None,
            llm_message: None,
            unmapped_keys: vec![
                "uuid".to_string(),
                "summary".to_string(),
                "collection_name".to_string(),
                "_REF_ID".to_string(),
            ],
            retrieval: true,
        }
    }

    /// Aggregation output over a collection
    pub fn aggregation(objects: Vec<JsonObject>, metadata: JsonObject) -> Self {
        Self::retrieval(ResultKind::Aggregation, objects, metadata)
    }

    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_metadata(mut self, metadata: JsonObject) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_mapping(mut self, mapping: BTreeMap<String, String>) -> Self {
        self.mapping = Some(mapping);
        self
    }

    pub fn with_llm_message<S: Into<String>>(mut self, llm_message: S) -> Self {
        self.llm_message = Some(llm_message.into());
        self
    }

    pub fn with_unmapped_keys(mut self, unmapped_keys: Vec<String>) -> Self {
        self.unmapped_keys = unmapped_keys;
        self
    }

    /// Number of objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Objects, optionally with the frontend mapping applied
    pub fn to_json(&self, mapping: bool) -> Vec<JsonObject> {
        let Some(map) = self.mapping.as_ref().filter(|_| mapping) else {
            return self.objects.clone();
        };

        self.objects
            .iter()
            .map(|obj| {
                let mut out = JsonObject::new();
                for (frontend_key, data_key) in map {
                    if data_key.is_empty() {
                        continue;
                    }
                    out.insert(
                        frontend_key.clone(),
                        obj.get(data_key).cloned().unwrap_or(Value::Null),
                    );
                }
                for key in &self.unmapped_keys {
                    if let Some(value) = obj.get(key) {
                        out.insert(key.clone(), value.clone());
                    }
                }
                out
            })
            .collect()
    }

    /// Fill the `llm_message` template
    pub fn format_llm_message(&self, template: &str) -> String {
        static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
        let re = PLACEHOLDER.get_or_init(|| {
            Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap_or_else(|_| unreachable!())
        });

        re.replace_all(template, |caps: &regex::Captures| {
            let key = &caps[1];
            match key {
                "type" => self.kind.as_str().to_string(),
                "name" => self.name.clone(),
                "num_objects" => self.len().to_string(),
                other => match self.metadata.get(other) {
                    Some(Value::String(s)) => s.clone(),
                    Some(value) => value.to_string(),
                    None => caps[0].to_string(),
                },
            }
        })
        .into_owned()
    }

    /// Summary of this result for the decision agent
    pub fn llm_parse(&self) -> String {
        if let Some(template) = &self.llm_message {
            return self.format_llm_message(template);
        }
        if self.kind == ResultKind::Aggregation {
            return self.aggregation_llm_parse();
        }
        if self.retrieval {
            return self.retrieval_llm_parse();
        }
        format!(
            "Displayed: A {} object with {} objects.",
            self.kind.as_str(),
            self.len()
        )
    }

    fn meta_str(&self, key: &str) -> Option<String> {
        self.metadata.get(key).map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    fn retrieval_llm_parse(&self) -> String {
        let mut out = String::new();
        let count = self.len();
        let collection = self.meta_str("collection_name");

        if let Some(collection) = &collection {
            if count != 0 {
                out.push_str(&format!(
                    "\nQueried collection: '{}' and returned {} objects, ",
                    collection, count
                ));
            } else {
                out.push_str(&format!(
                    "\nQueried collection: '{}' but no objects were returned.",
                    collection
                ));
                out.push_str(
                    " Since it had no objects, judge the query that was created, and evaluate \
                     whether it was appropriate for the collection, the user prompt, and the data available.",
                );
                out.push_str(
                    " If it seemed inappropriate, you can choose to try again if you think it can \
                     still be completed (or there is more to do).",
                );
            }
        }
        if let Some(return_type) = self.meta_str("return_type") {
            out.push_str(&format!("\nReturned with type '{}', ", return_type));
        }
        if let Some(output_type) = self.meta_str("output_type") {
            let shown = if output_type == "summary" {
                "itemised summaries"
            } else {
                "original objects"
            };
            out.push_str(&format!("\noutputted '{}'\n", shown));
        }
        if let Some(query_text) = self.meta_str("query_text") {
            out.push_str(&format!("\nSearch terms: '{}'", query_text));
        }
        if let Some(query_type) = self.meta_str("query_type") {
            out.push_str(&format!("\nType of query: '{}'", query_type));
        }
        if let Some(impossible) = self.meta_str("impossible") {
            out.push_str(&format!("\nImpossible prompt: '{}'", impossible));
            if let Some(collection) = &collection {
                out.push_str(&format!(
                    "\nThis attempt at querying the collection: {} was deemed impossible.",
                    collection
                ));
            }
            if let Some(reason) = self.meta_str("impossible_reason") {
                out.push_str(&format!("\nReasoning for impossibility: {}", reason));
            }
        }
        if let Some(message) = self.meta_str("assertion_error_message") {
            out.push_str(&format!(
                "\nWhen querying this collection ({}), the following ASSERTION error occurred:",
                collection.clone().unwrap_or_default()
            ));
            out.push_str(&format!(
                "\n<assertion_error_message>\n  {}\n</assertion_error_message>\n",
                message
            ));
            out.push_str(
                "You should judge whether this error is avoidable, and choose your task accordingly. \
                 An assertion error is usually fixable by changing the query.",
            );
        }
        if let Some(message) = self.meta_str("error_message") {
            out.push_str(&format!(
                "\nThe following GENERIC error occurred when querying this collection ({}):",
                collection.clone().unwrap_or_default()
            ));
            out.push_str(&format!(
                "\n<error_message>\n  {}\n</error_message>\n",
                message
            ));
            out.push_str(
                "These errors are usually outside of your control, such as a database or network problem. \
                 Apologise to the user and suggest alternatives unless the error looks transient.",
            );
        }
        if let Some(query_output) = self.meta_str("query_output") {
            out.push_str(&format!("\nThe query used was:\n{}", query_output));
        }
        out
    }

    fn aggregation_llm_parse(&self) -> String {
        let mut out = String::new();
        let Some(collection) = self.meta_str("collection_name") else {
            return out;
        };

        out.push_str(&format!("\nAggregated collection: '{}'", collection));
        if self.objects.is_empty() {
            out.push_str(" but no objects were returned.");
            out.push_str(
                " Since it had no objects, judge the aggregation that was created, and evaluate \
                 whether it was appropriate for the collection, the user prompt, and the data available.",
            );
        } else {
            let metrics: Vec<(String, usize)> = self
                .objects
                .iter()
                .flat_map(|obj| obj.iter())
                .filter(|(key, _)| key.as_str() != "groupedBy" && key.as_str() != "meta")
                .map(|(key, value)| {
                    let n = match value {
                        Value::Object(m) => m.len(),
                        Value::Array(a) => a.len(),
                        Value::Null => 0,
                        _ => 1,
                    };
                    (key.clone(), n)
                })
                .collect();
            for (metric, n) in &metrics {
                out.push_str(&format!(", returned {} values for {}.", n, metric));
            }
            if metrics.iter().any(|(_, n)| *n == 0) {
                out.push_str(
                    " For those metrics with 0 values, judge whether the aggregation was \
                     appropriate and try again if it can still be completed.",
                );
            }
        }
        if let Some(group_by) = self.meta_str("groupby_name") {
            out.push_str(&format!("\nGrouped by property '{}'", group_by));
        }
        if let Some(metrics) = self.meta_str("metrics") {
            out.push_str(&format!("\nReturned metrics for property(-ies) '{}'", metrics));
        }
        if let Some(impossible) = self.meta_str("impossible") {
            out.push_str(&format!(
                "\nThis attempt at aggregating the collection: {} was deemed impossible. \
                 The user prompt was: '{}'.",
                collection, impossible
            ));
        }
        if let Some(error) = self.meta_str("error_message") {
            out.push_str(&format!(
                "\n<error_message>\n  {}\n</error_message>\n",
                error
            ));
        }
        if let Some(query) = self.meta_str("aggregation_output") {
            out.push_str(&format!("\nThe aggregation query used was:\n{}", query));
        }
        out
    }

    /// Frontend envelope, `None` when there is nothing to display
    pub fn to_frontend(
        &self,
        user_id: &str,
        conversation_id: &str,
        query_id: &str,
    ) -> Option<FrontendPayload> {
        let objects = self.to_json(true);
        if objects.is_empty() {
            return None;
        }

        let mut payload = json!({
            "type": self.kind.as_str(),
            "objects": objects,
            "metadata": self.metadata,
        });
        if self.retrieval {
            if let Some(code) = self.metadata.get("code") {
                payload["code"] = code.clone();
            }
        }

        Some(FrontendPayload {
            payload_type: "result".to_string(),
            user_id: user_id.to_string(),
            conversation_id: conversation_id.to_string(),
            query_id: query_id.to_string(),
            id: frontend_id("result"),
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(value: Value) -> JsonObject {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_basic_result_frontend() {
        let metadata = obj(json!({"metadata_a": 1, "metadata_b": 2}));
        let result = ToolResult::generic(vec![obj(json!({"a": 1, "b": 2, "c": 3}))])
            .with_metadata(metadata.clone());

        assert_eq!(result.to_json(false), vec![obj(json!({"a": 1, "b": 2, "c": 3}))]);

        let frontend = result.to_frontend("user_id", "conversation_id", "query_id").unwrap();
        assert_eq!(frontend.payload_type, "result");
        assert_eq!(frontend.user_id, "user_id");
        assert_eq!(frontend.conversation_id, "conversation_id");
        assert_eq!(frontend.query_id, "query_id");
        assert!(frontend.id.starts_with("res-"));
        assert_eq!(frontend.payload["type"], "generic");
        assert_eq!(frontend.payload["objects"][0]["a"], 1);
        assert_eq!(frontend.payload["metadata"], Value::Object(metadata));
    }

    #[test]
    fn test_mapping_with_unmapped_keys() {
        let mapping: BTreeMap<String, String> = [
            ("title".to_string(), "product_name".to_string()),
            ("price".to_string(), "cost".to_string()),
            ("skipped".to_string(), String::new()),
        ]
        .into_iter()
        .collect();

        let result = ToolResult::ecommerce(vec![obj(json!({
            "product_name": "Lamp",
            "cost": 12.5,
            "uuid": "abc",
            "internal": true
        }))])
        .with_mapping(mapping)
        .with_unmapped_keys(vec!["uuid".to_string()]);

        let mapped = result.to_json(true);
        assert_eq!(mapped[0]["title"], "Lamp");
        assert_eq!(mapped[0]["price"], 12.5);
        assert_eq!(mapped[0]["uuid"], "abc");
        assert!(!mapped[0].contains_key("product_name"));
        assert!(!mapped[0].contains_key("internal"));
        assert!(!mapped[0].contains_key("skipped"));

        // unmapped view is untouched
        assert!(result.to_json(false)[0].contains_key("product_name"));
    }

    #[test]
    fn test_empty_result_has_no_payload() {
        let result = ToolResult::table(vec![]);
        assert!(result.to_frontend("u", "c", "q").is_none());
    }

    #[test]
    fn test_default_llm_parse() {
        let result = ToolResult::table(vec![obj(json!({"x": 1})), obj(json!({"x": 2}))]);
        assert_eq!(
            result.llm_parse(),
            "Displayed: A table object with 2 objects."
        );
    }

    #[test]
    fn test_llm_message_placeholders() {
        let result = ToolResult::generic(vec![obj(json!({"x": 1}))])
            .with_name("weather")
            .with_metadata(obj(json!({"city": "Paris", "days": 3})))
            .with_llm_message("{name}: {num_objects} {type} objects for {city} over {days} days {missing}");

        assert_eq!(
            result.llm_parse(),
            "weather: 1 generic objects for Paris over 3 days {missing}"
        );
    }

    #[test]
    fn test_retrieval_named_after_collection() {
        let result = ToolResult::retrieval(
            ResultKind::Document,
            vec![],
            obj(json!({"collection_name": "Articles", "query_text": "rust"})),
        );
        assert_eq!(result.name, "Articles");

        let parsed = result.llm_parse();
        assert!(parsed.contains("Queried collection: 'Articles' but no objects were returned."));
        assert!(parsed.contains("Search terms: 'rust'"));
    }

    #[test]
    fn test_retrieval_code_in_payload() {
        let result = ToolResult::retrieval(
            ResultKind::Generic,
            vec![obj(json!({"title": "t"}))],
            obj(json!({"collection_name": "c", "code": {"language": "graphql", "text": "{}"}})),
        );
        let frontend = result.to_frontend("u", "c", "q").unwrap();
        assert_eq!(frontend.payload["code"]["language"], "graphql");
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(ResultKind::from_name("Document"), ResultKind::Document);
        assert_eq!(
            ResultKind::from_name("chart"),
            ResultKind::Custom("chart".to_string())
        );
        assert_eq!(ResultKind::Custom("chart".into()).as_str(), "chart");
    }
}
