//! Summarise the environment for the user

use crate::error::Result;
use crate::impl_tool_factory;
use crate::llm::complete_json;
use crate::output::Text;
use crate::prompts;
use crate::tools::{Tool, ToolContext, ToolOutput, ToolSpec, ToolStream};
use async_trait::async_trait;
use futures::{stream, StreamExt};
use serde::Deserialize;

pub const SUMMARIZE: &str = "summarize";

#[derive(Debug, Deserialize)]
struct SummaryReply {
    #[serde(default)]
    title: String,
    summary: String,
}

pub struct SummarizeTool {
    spec: ToolSpec,
}

impl SummarizeTool {
    pub fn new() -> Self {
        Self {
            spec: ToolSpec::new(
                SUMMARIZE,
                "Summarise the retrieved objects in the environment for the user. Only useful \
                 once something has been retrieved. The summary is shown to the user.",
            )
            .with_status("Summarising results...")
            .with_end(true),
        }
    }
}

impl Default for SummarizeTool {
    fn default() -> Self {
        Self::new()
    }
}

async fn summarise(ctx: &ToolContext) -> Result<Text> {
    let data = prompts::tree_context(&ctx.tree_data);
    let messages = prompts::messages(&ctx.tree_data.atlas, prompts::SUMMARIZE, &data)?;
    let reply: SummaryReply = complete_json(ctx.base_lm.as_ref(), messages, None).await?;
    Ok(Text::summary(reply.summary, reply.title))
}

#[async_trait]
impl Tool for SummarizeTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    fn call(&self, ctx: ToolContext) -> ToolStream {
        stream::once(async move { summarise(&ctx).await.map(ToolOutput::Text) }).boxed()
    }
}

impl_tool_factory!(
    SummarizeToolFactory,
    SummarizeTool,
    SUMMARIZE,
    "Summarise the retrieved environment for the user"
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::MockLlmClient;
    use crate::tree::TreeData;
    use crate::weaviate::ClientManager;
    use futures::TryStreamExt;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_summary_output() {
        let lm = Arc::new(MockLlmClient::with_json_replies([json!({
            "title": "Weekly news",
            "summary": "Three articles about rivers."
        })]));
        let ctx = ToolContext::new(
            Arc::new(TreeData::default()),
            Default::default(),
            lm.clone(),
            lm.clone(),
            Arc::new(ClientManager::not_configured()),
        );

        let outputs: Vec<ToolOutput> = SummarizeTool::new().call(ctx).try_collect().await.unwrap();

        match &outputs[0] {
            ToolOutput::Text(text) => {
                assert_eq!(text.text_type, "summary");
                assert_eq!(text.content(), "Three articles about rivers.");
            }
            other => panic!("unexpected output {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unparseable_reply_is_an_error() {
        let lm = Arc::new(MockLlmClient::with_replies(["no json here"]));
        let ctx = ToolContext::new(
            Arc::new(TreeData::default()),
            Default::default(),
            lm.clone(),
            lm,
            Arc::new(ClientManager::not_configured()),
        );

        let outputs: Vec<_> = SummarizeTool::new().call(ctx).collect().await;
        assert_eq!(outputs.len(), 1);
        assert!(outputs[0].is_err());
    }
}
