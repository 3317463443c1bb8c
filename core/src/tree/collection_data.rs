//! Cached metadata about the collections a tree may query

use crate::error::Result;
use crate::output::JsonObject;
use crate::weaviate::{class_name, ClientManager};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Collection names in use plus their preprocessed metadata
/// (fields, mappings, length, summary, name)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionData {
    pub collection_names: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, JsonObject>,
    /// Lower-cased name to the class name the cluster reports
    #[serde(default)]
    pub class_names: BTreeMap<String, String>,
}

impl CollectionData {
    pub fn new(collection_names: Vec<String>) -> Self {
        Self {
            collection_names,
            metadata: BTreeMap::new(),
            class_names: BTreeMap::new(),
        }
    }

    /// Remember the cluster's spelling of each class
    pub fn record_class_names(&mut self, classes: &[String]) {
        for class in classes {
            self.class_names.insert(class.to_lowercase(), class.clone());
        }
    }

    /// Class name to send to the cluster for `name`.
    ///
    /// Falls back to the metadata record's `name`, then to a capitalised guess.
    pub fn class_name(&self, name: &str) -> String {
        let lower = name.to_lowercase();
        if let Some(class) = self.class_names.get(&lower) {
            return class.clone();
        }
        self.metadata
            .get(name)
            .or_else(|| self.metadata.get(&lower))
            .and_then(|m| m.get("name"))
            .and_then(Value::as_str)
            .filter(|n| n.eq_ignore_ascii_case(name))
            .map(str::to_string)
            .unwrap_or_else(|| class_name(name))
    }

    /// Use `names`, loading metadata not yet cached.
    ///
    /// Names without a metadata record, or missing from the cluster, are dropped.
    /// Returns the names kept.
    pub async fn set_collection_names(
        &mut self,
        names: &[String],
        client: &ClientManager,
    ) -> Result<Vec<String>> {
        let to_fetch: Vec<String> = names
            .iter()
            .filter(|n| !self.metadata.contains_key(n.as_str()))
            .cloned()
            .collect();

        let mut missing = Vec::new();
        let mut not_preprocessed = Vec::new();
        if !to_fetch.is_empty() && client.is_client() {
            let classes = client.list_collections().await?;
            self.record_class_names(&classes);
            let existing: Vec<String> = classes.iter().map(|c| c.to_lowercase()).collect();
            let fetched = client.fetch_metadata(&to_fetch).await?;

            for name in &to_fetch {
                if !existing.contains(&name.to_lowercase()) {
                    missing.push(name.clone());
                } else if let Some(metadata) = fetched.get(&name.to_lowercase()) {
                    self.metadata.insert(name.clone(), metadata.clone());
                } else {
                    not_preprocessed.push(name.clone());
                }
            }
        } else {
            not_preprocessed.extend(to_fetch);
        }

        if !not_preprocessed.is_empty() {
            tracing::warn!(
                "The following collections have not been pre-processed: {:?}. Ignoring these collections for now.",
                not_preprocessed
            );
        }
        if !missing.is_empty() {
            tracing::warn!(
                "The following collections cannot be found in this cluster: {:?}. Please check that the collection names are correct.",
                missing
            );
        }

        self.collection_names = names
            .iter()
            .filter(|n| !missing.contains(n) && !not_preprocessed.contains(n))
            .cloned()
            .collect();
        Ok(self.collection_names.clone())
    }

    /// Metadata for `names` (default: all in use), without `mappings` unless asked
    pub fn output_full_metadata(
        &self,
        names: Option<&[String]>,
        with_mappings: bool,
    ) -> BTreeMap<String, JsonObject> {
        let names = names.unwrap_or(&self.collection_names);
        names
            .iter()
            .filter_map(|name| {
                let metadata = self.metadata.get(name)?;
                let metadata = if with_mappings {
                    metadata.clone()
                } else {
                    metadata
                        .iter()
                        .filter(|(k, _)| k.as_str() != "mappings")
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect()
                };
                Some((name.clone(), metadata))
            })
            .collect()
    }

    /// `summary` of each collection in use
    pub fn output_collection_summaries(&self) -> BTreeMap<String, String> {
        self.collection_names
            .iter()
            .filter_map(|name| {
                let summary = self.metadata.get(name)?.get("summary")?.as_str()?;
                Some((name.clone(), summary.to_string()))
            })
            .collect()
    }

    /// Mapping (display type) names available per collection
    pub fn output_collection_return_types(&self) -> BTreeMap<String, Vec<String>> {
        self.collection_names
            .iter()
            .map(|name| {
                let types = self
                    .mappings(name)
                    .map(|m| m.keys().cloned().collect())
                    .unwrap_or_default();
                (name.clone(), types)
            })
            .collect()
    }

    /// Frontend mappings of a collection
    pub fn mappings(&self, name: &str) -> Option<&JsonObject> {
        self.metadata.get(name)?.get("mappings")?.as_object()
    }

    /// Field names listed in a collection's metadata
    pub fn field_names(&self, name: &str) -> Vec<String> {
        match self.metadata.get(name).and_then(|m| m.get("fields")) {
            Some(Value::Object(fields)) => fields.keys().cloned().collect(),
            Some(Value::Array(fields)) => fields
                .iter()
                .filter_map(|f| f.get("name").and_then(Value::as_str).map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data() -> CollectionData {
        let mut data = CollectionData::new(vec!["articles".to_string()]);
        data.metadata.insert(
            "articles".to_string(),
            json!({
                "name": "articles",
                "summary": "News articles",
                "length": 120,
                "fields": {"title": {"type": "text"}, "date": {"type": "date"}},
                "mappings": {"document": {"title": "title", "content": "body"}}
            })
            .as_object()
            .cloned()
            .unwrap(),
        );
        data
    }

    #[test]
    fn test_output_full_metadata() {
        let data = data();
        let without = data.output_full_metadata(None, false);
        assert!(!without["articles"].contains_key("mappings"));
        assert_eq!(without["articles"]["summary"], "News articles");

        let with = data.output_full_metadata(None, true);
        assert!(with["articles"].contains_key("mappings"));
    }

    #[test]
    fn test_return_types_and_fields() {
        let data = data();
        assert_eq!(
            data.output_collection_return_types()["articles"],
            vec!["document".to_string()]
        );
        let mut fields = data.field_names("articles");
        fields.sort();
        assert_eq!(fields, vec!["date", "title"]);
        assert_eq!(data.output_collection_summaries()["articles"], "News articles");
    }

    #[tokio::test]
    async fn test_without_client_drops_unknown() {
        let mut data = data();
        let kept = data
            .set_collection_names(
                &["articles".to_string(), "unknown".to_string()],
                &ClientManager::not_configured(),
            )
            .await
            .unwrap();
        assert_eq!(kept, vec!["articles".to_string()]);
    }

    #[test]
    fn test_class_name_resolution() {
        let mut data = data();
        assert_eq!(data.class_name("articles"), "Articles");

        data.record_class_names(&["ArticleComments".to_string()]);
        assert_eq!(data.class_name("articlecomments"), "ArticleComments");
        assert_eq!(data.class_name("ARTICLECOMMENTS"), "ArticleComments");

        data.metadata.insert(
            "productreviews".to_string(),
            json!({"name": "ProductReviews"}).as_object().cloned().unwrap(),
        );
        assert_eq!(data.class_name("productreviews"), "ProductReviews");
    }
}
