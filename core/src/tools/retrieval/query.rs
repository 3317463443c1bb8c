//! Search a collection with a model-planned query

use super::{check_collection, display_mapping, retrieval_available, NEEDS_CLIENT};
use crate::error::Result;
use crate::impl_tool_factory;
use crate::llm::complete_json;
use crate::output::{JsonObject, ResultKind, ToolResult};
use crate::prompts;
use crate::tools::{Tool, ToolContext, ToolOutput, ToolSpec, ToolStream};
use crate::tree::TreeData;
use crate::weaviate::{ClientManager, SearchQuery, SearchType, SortBy};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

pub const QUERY: &str = "query";

fn default_search_type() -> SearchType {
    SearchType::Hybrid
}

fn default_limit() -> usize {
    5
}

/// What the complex model decides to search for
#[derive(Debug, Clone, Deserialize)]
pub struct QueryPlan {
    #[serde(default)]
    pub collection_name: Option<String>,
    #[serde(default = "default_search_type")]
    pub search_type: SearchType,
    #[serde(default)]
    pub search_query: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub sort_by: Option<SortBy>,
    #[serde(default)]
    pub display_type: Option<String>,
    #[serde(default)]
    pub impossible: bool,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub message_update: String,
}

pub struct QueryTool {
    spec: ToolSpec,
}

impl QueryTool {
    pub fn new() -> Self {
        Self {
            spec: ToolSpec::new(
                QUERY,
                "Retrieve objects from one of the collections with a keyword, semantic or hybrid \
                 search, or fetch them with an optional sort. Use when the user wants specific \
                 items or information stored in the data.",
            )
            .with_status("Querying...")
            .with_available_at(NEEDS_CLIENT),
        }
    }
}

impl Default for QueryTool {
    fn default() -> Self {
        Self::new()
    }
}

async fn plan_query(ctx: &ToolContext) -> Result<QueryPlan> {
    let tree_data = &ctx.tree_data;
    let mut data = prompts::tree_context(tree_data);
    data.insert(
        "collection_information".into(),
        prompts::to_prompt_json(&tree_data.output_collection_metadata(true)).into(),
    );
    data.insert(
        "return_types".into(),
        prompts::to_prompt_json(&tree_data.output_collection_return_types()).into(),
    );
    data.insert(
        "previous_errors".into(),
        prompts::to_prompt_json(&tree_data.get_errors()).into(),
    );

    let messages = prompts::messages(&tree_data.atlas, prompts::QUERY_PLAN, &data)?;
    complete_json(ctx.complex_lm.as_ref(), messages, None).await
}

/// Properties to return: preprocessed field names, else the live schema
async fn properties_for(ctx: &ToolContext, collection: &str) -> Result<Vec<String>> {
    let fields = ctx.tree_data.collection_data.field_names(collection);
    if !fields.is_empty() {
        return Ok(fields);
    }
    let class = ctx.tree_data.collection_data.class_name(collection);
    ctx.client_manager.collection_properties(&class).await
}

fn search_metadata(plan: &QueryPlan, collection: &str, display_type: &str) -> JsonObject {
    let mut metadata = JsonObject::new();
    metadata.insert("collection_name".into(), collection.into());
    metadata.insert("return_type".into(), display_type.into());
    metadata.insert("output_type".into(), "original".into());
    metadata.insert("query_type".into(), plan.search_type.as_str().into());
    if let Some(terms) = plan.search_query.as_deref().filter(|t| !t.is_empty()) {
        metadata.insert("query_text".into(), terms.into());
    }
    metadata
}

#[async_trait]
impl Tool for QueryTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn is_tool_available(&self, tree_data: &TreeData, client: &ClientManager) -> bool {
        retrieval_available(tree_data, client).await
    }

    fn call(&self, ctx: ToolContext) -> ToolStream {
        Box::pin(async_stream::stream! {
            let plan = match plan_query(&ctx).await {
                Ok(plan) => plan,
                Err(e) => {
                    yield Ok(ToolOutput::error(format!("Could not plan a query: {}", e)));
                    return;
                }
            };
            tracing::debug!("Query plan: {:?}", plan);

            if !plan.message_update.trim().is_empty() {
                yield Ok(ToolOutput::response(plan.message_update.trim()));
            }

            if plan.impossible {
                let mut metadata = JsonObject::new();
                if let Some(collection) = &plan.collection_name {
                    metadata.insert("collection_name".into(), collection.as_str().into());
                }
                metadata.insert("impossible".into(), Value::Bool(true));
                metadata.insert("impossible_reason".into(), plan.reasoning.clone().into());
                yield Ok(ToolResult::retrieval(ResultKind::Generic, Vec::new(), metadata).into());
                return;
            }

            let collection = match check_collection(QUERY, &ctx.tree_data, plan.collection_name.as_deref()) {
                Ok(collection) => collection,
                Err(e) => {
                    yield Ok(ToolOutput::error(e.to_string()));
                    return;
                }
            };

            let display_type = plan.display_type.clone().unwrap_or_else(|| "generic".to_string());
            let mapping = display_mapping(&ctx.tree_data, &collection, &display_type);
            let kind = if mapping.is_some() {
                ResultKind::from_name(&display_type)
            } else {
                ResultKind::Generic
            };

            yield Ok(ToolOutput::status(format!("Querying {}...", collection)));

            let query = SearchQuery {
                collection: collection.clone(),
                search_type: plan.search_type,
                search_query: plan.search_query.clone(),
                limit: plan.limit,
                sort_by: plan.sort_by.clone(),
                class_name: Some(ctx.tree_data.collection_data.class_name(&collection)),
            };
            let mut metadata = search_metadata(&plan, &collection, kind.as_str());

            let searched = match properties_for(&ctx, &collection).await {
                Ok(properties) => query
                    .to_graphql(&properties)
                    .map(|graphql| (properties, graphql)),
                Err(e) => Err(e),
            };
            let (properties, graphql) = match searched {
                Ok(found) => found,
                Err(e) => {
                    yield Ok(ToolOutput::error(format!("Error building query for '{}': {}", collection, e)));
                    return;
                }
            };
            metadata.insert("query_output".into(), graphql.into());

            match ctx.client_manager.search(&query, &properties).await {
                Ok(objects) => {
                    tracing::info!("Query on {} returned {} objects", collection, objects.len());
                    let mut result = ToolResult::retrieval(kind, objects, metadata);
                    if let Some(mapping) = mapping {
                        result = result.with_mapping(mapping);
                    }
                    yield Ok(result.into());
                }
                Err(e) => {
                    yield Ok(ToolOutput::error(format!("Error querying '{}': {}", collection, e)));
                }
            }
        })
    }
}

impl_tool_factory!(
    QueryToolFactory,
    QueryTool,
    QUERY,
    "Search a collection with a planned keyword, semantic or hybrid query"
);
