//! Tools that read from the vector database

pub mod aggregate;
pub mod query;

pub use aggregate::{AggregateTool, AggregateToolFactory, AGGREGATE};
pub use query::{QueryTool, QueryToolFactory, QUERY};

use crate::error::{Result, ToolError};
use crate::tree::TreeData;
use crate::weaviate::ClientManager;
use std::collections::BTreeMap;

const NEEDS_CLIENT: &str = "Requires a connected vector database (set WCD_URL and WCD_API_KEY) \
                            with at least one preprocessed collection.";

/// Both retrieval tools need a client and something to search
async fn retrieval_available(tree_data: &TreeData, client: &ClientManager) -> bool {
    client.is_client() && !client.is_closed() && !tree_data.collection_names.is_empty()
}

/// Resolve the collection a plan names against the collections in use
fn check_collection(tool: &str, tree_data: &TreeData, collection: Option<&str>) -> Result<String> {
    let Some(collection) = collection.map(str::trim).filter(|c| !c.is_empty()) else {
        return Err(ToolError::InvalidParameters {
            message: format!("{} plan did not name a collection", tool),
        }
        .into());
    };

    tree_data
        .collection_names
        .iter()
        .find(|name| name.eq_ignore_ascii_case(collection))
        .cloned()
        .ok_or_else(|| {
            ToolError::InvalidParameters {
                message: format!(
                    "Collection '{}' is not one of the available collections: {:?}",
                    collection, tree_data.collection_names
                ),
            }
            .into()
        })
}

/// Frontend mapping for a display type, `frontend key -> field`
fn display_mapping(
    tree_data: &TreeData,
    collection: &str,
    display_type: &str,
) -> Option<BTreeMap<String, String>> {
    let mapping = tree_data
        .collection_data
        .mappings(collection)?
        .get(display_type)?
        .as_object()?;
    Some(
        mapping
            .iter()
            .filter_map(|(key, field)| field.as_str().map(|f| (key.clone(), f.to_string())))
            .collect(),
    )
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::tree::{CollectionData, TreeData};
    use serde_json::json;

    /// Tree data with one preprocessed `articles` collection
    pub fn articles_tree_data() -> TreeData {
        let mut collection_data = CollectionData::new(vec!["articles".to_string()]);
        collection_data.metadata.insert(
            "articles".to_string(),
            json!({
                "name": "articles",
                "summary": "News articles",
                "length": 3,
                "fields": {"title": {"type": "text"}, "body": {"type": "text"}, "views": {"type": "int"}},
                "mappings": {"document": {"title": "title", "content": "body"}}
            })
            .as_object()
            .cloned()
            .unwrap(),
        );
        let mut tree_data = TreeData::new(collection_data, Default::default());
        tree_data.collection_names = vec!["articles".to_string()];
        tree_data.user_prompt = "Find articles about rivers".to_string();
        tree_data
    }
}
