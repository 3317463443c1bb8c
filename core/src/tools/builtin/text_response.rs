//! Tools that talk back to the user

use crate::error::Result;
use crate::impl_tool_factory;
use crate::prompts;
use crate::tools::{InputSpec, Tool, ToolContext, ToolOutput, ToolSpec, ToolStream};
use async_trait::async_trait;
use futures::{stream, StreamExt};

pub const TEXT_RESPONSE: &str = "text_response";
pub const FINAL_TEXT_RESPONSE: &str = "final_text_response";

/// Replies with text the decision agent already wrote
pub struct TextResponseTool {
    spec: ToolSpec,
}

impl TextResponseTool {
    pub fn new() -> Self {
        Self {
            spec: ToolSpec::new(
                TEXT_RESPONSE,
                "End the conversation and reply to the user directly. Use this when the request \
                 can be answered from the conversation and environment alone, when the user asks \
                 a question about the system, or when nothing else can help.",
            )
            .with_input(
                "text",
                InputSpec::new("The full reply to show the user", "str").required(),
            )
            .with_status("Writing response...")
            .with_end(true),
        }
    }
}

impl Default for TextResponseTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for TextResponseTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    fn call(&self, ctx: ToolContext) -> ToolStream {
        let text = ctx.input_str("text");
        stream::once(async move { Ok(ToolOutput::response(text)) }).boxed()
    }
}

/// Writes a closing reply from the environment with the base model.
///
/// Never offered to the decision agent. The tree runs it when a query ends on
/// an option that does not itself answer the user.
pub struct FinalTextResponseTool {
    spec: ToolSpec,
}

impl FinalTextResponseTool {
    pub fn new() -> Self {
        Self {
            spec: ToolSpec::new(
                FINAL_TEXT_RESPONSE,
                "Write a final reply to the user based on everything gathered so far.",
            )
            .with_status("Writing final response...")
            .with_end(true),
        }
    }
}

impl Default for FinalTextResponseTool {
    fn default() -> Self {
        Self::new()
    }
}

async fn final_response(ctx: &ToolContext) -> Result<String> {
    let data = prompts::tree_context(&ctx.tree_data);
    let messages = prompts::messages(&ctx.tree_data.atlas, prompts::FINAL_RESPONSE, &data)?;
    let response = ctx.base_lm.chat_completion(messages, None).await?;
    Ok(response.message.get_text().trim().to_string())
}

#[async_trait]
impl Tool for FinalTextResponseTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    fn call(&self, ctx: ToolContext) -> ToolStream {
        stream::once(async move { final_response(&ctx).await.map(ToolOutput::response) }).boxed()
    }
}

impl_tool_factory!(
    TextResponseToolFactory,
    TextResponseTool,
    TEXT_RESPONSE,
    "Reply to the user directly and end the conversation turn"
);

impl_tool_factory!(
    FinalTextResponseToolFactory,
    FinalTextResponseTool,
    FINAL_TEXT_RESPONSE,
    "Write a closing reply from the gathered environment"
);
