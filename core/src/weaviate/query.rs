//! GraphQL search and aggregation builders

use crate::error::{ClientError, Result};
use crate::output::JsonObject;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Guessed GraphQL class name for a collection: first letter upper-cased.
///
/// Only right for single-word names; prefer the name the schema reports.
pub fn class_name(collection: &str) -> String {
    let mut chars = collection.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn quote(s: &str) -> String {
    // JSON string literals are valid GraphQL string literals
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

/// How objects are retrieved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchType {
    /// Keyword + vector
    Hybrid,
    /// BM25
    Keyword,
    /// Vector similarity
    Semantic,
    /// No search terms, optionally sorted
    Fetch,
}

impl SearchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchType::Hybrid => "hybrid",
            SearchType::Keyword => "keyword",
            SearchType::Semantic => "semantic",
            SearchType::Fetch => "fetch",
        }
    }
}

/// Sort order for fetch queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortBy {
    pub property: String,
    #[serde(default = "default_true")]
    pub ascending: bool,
}

fn default_true() -> bool {
    true
}

fn default_limit() -> usize {
    5
}

/// A planned search over one collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub collection: String,
    pub search_type: SearchType,
    #[serde(default)]
    pub search_query: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub sort_by: Option<SortBy>,
    /// Class name as stored in the cluster, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
}

impl SearchQuery {
    pub fn with_class_name<S: Into<String>>(mut self, class_name: S) -> Self {
        self.class_name = Some(class_name.into());
        self
    }

    /// Class to address in GraphQL
    pub fn class(&self) -> String {
        self.class_name
            .clone()
            .unwrap_or_else(|| class_name(&self.collection))
    }

    /// Render as a GraphQL `Get` returning `properties` plus the object id
    pub fn to_graphql(&self, properties: &[String]) -> Result<String> {
        let mut args = vec![format!("limit: {}", self.limit.max(1))];
        let terms = self.search_query.as_deref().unwrap_or("").trim();

        match self.search_type {
            SearchType::Fetch => {}
            _ if terms.is_empty() => {
                return Err(ClientError::Query {
                    message: format!(
                        "a {} search needs search terms",
                        self.search_type.as_str()
                    ),
                }
                .into());
            }
            SearchType::Hybrid => args.push(format!("hybrid: {{query: {}}}", quote(terms))),
            SearchType::Keyword => args.push(format!("bm25: {{query: {}}}", quote(terms))),
            SearchType::Semantic => {
                args.push(format!("nearText: {{concepts: [{}]}}", quote(terms)))
            }
        }
        if let Some(sort) = &self.sort_by {
            args.push(format!(
                "sort: [{{path: [{}], order: {}}}]",
                quote(&sort.property),
                if sort.ascending { "asc" } else { "desc" }
            ));
        }

        Ok(format!(
            "{{ Get {{ {}({}) {{ {} _additional {{ id }} }} }} }}",
            self.class(),
            args.join(", "),
            properties.join(" ")
        ))
    }

    /// Flatten `data.Get.<Class>` into records with a `uuid` key
    pub fn parse_response(&self, data: &Value) -> Vec<JsonObject> {
        let class = self.class();
        data.get("Get")
            .and_then(|get| get.get(&class))
            .and_then(Value::as_array)
            .map(|objects| {
                objects
                    .iter()
                    .filter_map(Value::as_object)
                    .map(|obj| {
                        let mut out = obj.clone();
                        if let Some(Value::Object(additional)) = out.remove("_additional") {
                            if let Some(id) = additional.get("id") {
                                out.insert("uuid".to_string(), id.clone());
                            }
                        }
                        out.insert(
                            "collection_name".to_string(),
                            Value::String(self.collection.clone()),
                        );
                        out
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Statistic computed over a property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Count,
    Sum,
    Mean,
    Minimum,
    Maximum,
    Median,
    Mode,
    TopOccurrences,
}

impl Metric {
    fn selection(&self) -> &'static str {
        match self {
            Metric::Count => "count",
            Metric::Sum => "sum",
            Metric::Mean => "mean",
            Metric::Minimum => "minimum",
            Metric::Maximum => "maximum",
            Metric::Median => "median",
            Metric::Mode => "mode",
            Metric::TopOccurrences => "topOccurrences { value occurs }",
        }
    }
}

/// Metrics requested for one property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyMetrics {
    pub property: String,
    pub metrics: Vec<Metric>,
}

/// A planned aggregation over one collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateQuery {
    pub collection: String,
    #[serde(default)]
    pub group_by: Option<String>,
    #[serde(default)]
    pub properties: Vec<PropertyMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
}

impl AggregateQuery {
    pub fn with_class_name<S: Into<String>>(mut self, class_name: S) -> Self {
        self.class_name = Some(class_name.into());
        self
    }

    pub fn class(&self) -> String {
        self.class_name
            .clone()
            .unwrap_or_else(|| class_name(&self.collection))
    }

    pub fn to_graphql(&self) -> String {
        let args = match &self.group_by {
            Some(group_by) => format!("(groupBy: [{}])", quote(group_by)),
            None => String::new(),
        };

        let mut selections = vec!["meta { count }".to_string()];
        if self.group_by.is_some() {
            selections.push("groupedBy { path value }".to_string());
        }
        for property in &self.properties {
            if property.metrics.is_empty() {
                continue;
            }
            let metrics: Vec<&str> = property.metrics.iter().map(Metric::selection).collect();
            selections.push(format!("{} {{ {} }}", property.property, metrics.join(" ")));
        }

        format!(
            "{{ Aggregate {{ {}{} {{ {} }} }} }}",
            self.class(),
            args,
            selections.join(" ")
        )
    }

    /// Aggregation groups under `data.Aggregate.<Class>`
    pub fn parse_response(&self, data: &Value) -> Vec<JsonObject> {
        let class = self.class();
        let groups = data
            .get("Aggregate")
            .and_then(|agg| agg.get(&class))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        if groups.is_empty() {
            return Vec::new();
        }

        let mut out = JsonObject::new();
        out.insert(self.collection.clone(), json!(groups));
        vec![out]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn search(search_type: SearchType, terms: Option<&str>) -> SearchQuery {
        SearchQuery {
            collection: "articles".to_string(),
            search_type,
            search_query: terms.map(str::to_string),
            limit: 3,
            sort_by: None,
            class_name: None,
        }
    }

    #[test]
    fn test_class_name() {
        assert_eq!(class_name("articles"), "Articles");
        assert_eq!(class_name("ELYSIA_METADATA__"), "ELYSIA_METADATA__");
        assert_eq!(class_name(""), "");
    }

    #[test]
    fn test_search_graphql() {
        let props = vec!["title".to_string(), "body".to_string()];

        let hybrid = search(SearchType::Hybrid, Some("rust \"async\""))
            .to_graphql(&props)
            .unwrap();
        assert_eq!(
            hybrid,
            r#"{ Get { Articles(limit: 3, hybrid: {query: "rust \"async\""}) { title body _additional { id } } } }"#
        );

        let keyword = search(SearchType::Keyword, Some("tokio")).to_graphql(&props).unwrap();
        assert!(keyword.contains("bm25: {query: \"tokio\"}"));

        let semantic = search(SearchType::Semantic, Some("runtime")).to_graphql(&props).unwrap();
        assert!(semantic.contains("nearText: {concepts: [\"runtime\"]}"));
    }

    #[test]
    fn test_search_requires_terms() {
        assert!(search(SearchType::Hybrid, None).to_graphql(&[]).is_err());
        assert!(search(SearchType::Fetch, None).to_graphql(&[]).is_ok());
    }

    #[test]
    fn test_fetch_with_sort() {
        let mut query = search(SearchType::Fetch, None);
        query.sort_by = Some(SortBy {
            property: "date".to_string(),
            ascending: false,
        });
        let gql = query.to_graphql(&["title".to_string()]).unwrap();
        assert!(gql.contains("sort: [{path: [\"date\"], order: desc}]"));
    }

    #[test]
    fn test_schema_class_name_is_kept() {
        let query = SearchQuery {
            collection: "articlecomments".to_string(),
            ..search(SearchType::Fetch, None)
        }
        .with_class_name("ArticleComments");
        let gql = query.to_graphql(&["comment".to_string()]).unwrap();
        assert!(gql.starts_with("{ Get { ArticleComments(limit: 3)"));

        let data = json!({"Get": {"ArticleComments": [{"comment": "hi"}]}});
        let objects = query.parse_response(&data);
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0]["collection_name"], "articlecomments");

        let aggregate = AggregateQuery {
            collection: "articlecomments".to_string(),
            group_by: None,
            properties: vec![],
            class_name: None,
        }
        .with_class_name("ArticleComments");
        assert!(aggregate.to_graphql().contains("Aggregate { ArticleComments {"));
    }

    #[test]
    fn test_parse_search_response() {
        let data = json!({
            "Get": {"Articles": [
                {"title": "a", "_additional": {"id": "id-1"}},
                {"title": "b", "_additional": {"id": "id-2"}}
            ]}
        });
        let objects = search(SearchType::Fetch, None).parse_response(&data);
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0]["uuid"], "id-1");
        assert_eq!(objects[1]["collection_name"], "articles");
        assert!(!objects[0].contains_key("_additional"));
    }

    #[test]
    fn test_aggregate_graphql() {
        let query = AggregateQuery {
            collection: "products".to_string(),
            group_by: Some("category".to_string()),
            properties: vec![PropertyMetrics {
                property: "price".to_string(),
                metrics: vec![Metric::Mean, Metric::Maximum],
            }],
            class_name: None,
        };
        assert_eq!(
            query.to_graphql(),
            r#"{ Aggregate { Products(groupBy: ["category"]) { meta { count } groupedBy { path value } price { mean maximum } } } }"#
        );

        let data = json!({"Aggregate": {"Products": [{"meta": {"count": 4}}]}});
        let parsed = query.parse_response(&data);
        assert_eq!(parsed[0]["products"][0]["meta"]["count"], 4);

        assert!(query.parse_response(&json!({})).is_empty());
    }
}
