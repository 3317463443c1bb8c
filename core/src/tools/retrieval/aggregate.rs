//! Statistics over a collection with a model-planned aggregation

use super::{check_collection, retrieval_available, NEEDS_CLIENT};
use crate::error::Result;
use crate::impl_tool_factory;
use crate::llm::complete_json;
use crate::output::{JsonObject, ToolResult};
use crate::prompts;
use crate::tools::{Tool, ToolContext, ToolOutput, ToolSpec, ToolStream};
use crate::tree::TreeData;
use crate::weaviate::{AggregateQuery, ClientManager, PropertyMetrics};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

pub const AGGREGATE: &str = "aggregate";

#[derive(Debug, Clone, Deserialize)]
pub struct AggregatePlan {
    #[serde(default)]
    pub collection_name: Option<String>,
    #[serde(default)]
    pub group_by: Option<String>,
    #[serde(default)]
    pub properties: Vec<PropertyMetrics>,
    #[serde(default)]
    pub impossible: bool,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub message_update: String,
}

pub struct AggregateTool {
    spec: ToolSpec,
}

impl AggregateTool {
    pub fn new() -> Self {
        Self {
            spec: ToolSpec::new(
                AGGREGATE,
                "Compute statistics over a collection: counts, sums, averages, extremes or the \
                 most common values, optionally grouped by a property. Use for questions about \
                 totals and distributions rather than specific items.",
            )
            .with_status("Aggregating...")
            .with_available_at(NEEDS_CLIENT),
        }
    }
}

impl Default for AggregateTool {
    fn default() -> Self {
        Self::new()
    }
}

async fn plan_aggregation(ctx: &ToolContext) -> Result<AggregatePlan> {
    let tree_data = &ctx.tree_data;
    let mut data = prompts::tree_context(tree_data);
    data.insert(
        "previous_errors".into(),
        prompts::to_prompt_json(&tree_data.get_errors()).into(),
    );
    let messages = prompts::messages(&tree_data.atlas, prompts::AGGREGATE_PLAN, &data)?;
    complete_json(ctx.complex_lm.as_ref(), messages, None).await
}

#[async_trait]
impl Tool for AggregateTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn is_tool_available(&self, tree_data: &TreeData, client: &ClientManager) -> bool {
        retrieval_available(tree_data, client).await
    }

    fn call(&self, ctx: ToolContext) -> ToolStream {
        Box::pin(async_stream::stream! {
            let plan = match plan_aggregation(&ctx).await {
                Ok(plan) => plan,
                Err(e) => {
                    yield Ok(ToolOutput::error(format!("Could not plan an aggregation: {}", e)));
                    return;
                }
            };
            tracing::debug!("Aggregation plan: {:?}", plan);

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
                yield Ok(ToolResult::aggregation(Vec::new(), metadata).into());
                return;
            }

            let collection = match check_collection(AGGREGATE, &ctx.tree_data, plan.collection_name.as_deref()) {
                Ok(collection) => collection,
                Err(e) => {
                    yield Ok(ToolOutput::error(e.to_string()));
                    return;
                }
            };

            yield Ok(ToolOutput::status(format!("Aggregating {}...", collection)));

            let query = AggregateQuery {
                collection: collection.clone(),
                group_by: plan.group_by.clone(),
                properties: plan.properties.clone(),
                class_name: Some(ctx.tree_data.collection_data.class_name(&collection)),
            };
            let mut metadata = JsonObject::new();
            metadata.insert("collection_name".into(), collection.as_str().into());
            metadata.insert("query_output".into(), query.to_graphql().into());
            if let Some(group_by) = &plan.group_by {
                metadata.insert("group_by".into(), group_by.as_str().into());
            }

            match ctx.client_manager.aggregate(&query).await {
                Ok(objects) => yield Ok(ToolResult::aggregation(objects, metadata).into()),
                Err(e) => {
                    yield Ok(ToolOutput::error(format!("Error aggregating '{}': {}", collection, e)));
                }
            }
        })
    }
}

impl_tool_factory!(
    AggregateToolFactory,
    AggregateTool,
    AGGREGATE,
    "Compute grouped statistics over a collection"
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::MockLlmClient;
    use crate::output::{ResultKind, Update};
    use crate::tools::retrieval::test_support::articles_tree_data;
    use futures::TryStreamExt;
    use serde_json::json;
    use std::sync::Arc;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn context(plan: Value, client: ClientManager) -> ToolContext {
        let lm = Arc::new(MockLlmClient::with_json_replies([plan]));
        ToolContext::new(
            Arc::new(articles_tree_data()),
            JsonObject::new(),
            lm.clone(),
            lm,
            Arc::new(client),
        )
    }

    #[tokio::test]
    async fn test_aggregation_result() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/graphql"))
            .and(body_partial_json(json!({
                "query": "{ Aggregate { Articles { meta { count } views { mean maximum } } } }"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"Aggregate": {"Articles": [
                    {"meta": {"count": 3}, "views": {"mean": 2.0, "maximum": 3}}
                ]}}
            })))
            .mount(&server)
            .await;

        let ctx = context(
            json!({
                "collection_name": "Articles",
                "properties": [{"property": "views", "metrics": ["mean", "maximum"]}]
            }),
            ClientManager::new(server.uri(), "key"),
        );

        let outputs: Vec<ToolOutput> = AggregateTool::new().call(ctx).try_collect().await.unwrap();
        assert!(matches!(&outputs[0], ToolOutput::Update(Update::Status { .. })));
        let ToolOutput::Result(result) = &outputs[1] else {
            panic!("expected a result, got {:?}", outputs[1]);
        };
        assert_eq!(result.kind, ResultKind::Aggregation);
        assert_eq!(result.name, "articles");
        assert_eq!(result.objects[0]["articles"][0]["meta"]["count"], 3);
    }

    #[tokio::test]
    async fn test_failed_plan_is_an_error_output() {
        let lm = Arc::new(MockLlmClient::with_replies(["not json at all"]));
        let ctx = ToolContext::new(
            Arc::new(articles_tree_data()),
            JsonObject::new(),
            lm.clone(),
            lm,
            Arc::new(ClientManager::new("http://localhost:1", "key")),
        );

        let outputs: Vec<ToolOutput> = AggregateTool::new().call(ctx).try_collect().await.unwrap();
        assert!(matches!(&outputs[0], ToolOutput::Update(Update::Error { .. })));
    }
}
