//! Tools built from plain async closures

use crate::error::Result;
use crate::tools::{Tool, ToolContext, ToolOutput, ToolSpec, ToolStream};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;

type ToolFn = Arc<dyn Fn(ToolContext) -> BoxFuture<'static, Result<Vec<ToolOutput>>> + Send + Sync>;

/// A tool whose body is an async function returning its outputs
pub struct FunctionTool {
    spec: ToolSpec,
    func: ToolFn,
}

impl FunctionTool {
    pub fn new<F, Fut>(spec: ToolSpec, func: F) -> Self
    where
        F: Fn(ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<ToolOutput>>> + Send + 'static,
    {
        Self {
            spec,
            func: Arc::new(move |ctx| func(ctx).boxed()),
        }
    }
}

#[async_trait]
impl Tool for FunctionTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    fn call(&self, ctx: ToolContext) -> ToolStream {
        let outputs = (self.func)(ctx);
        Box::pin(async_stream::stream! {
            match outputs.await {
                Ok(outputs) => {
                    for output in outputs {
                        yield Ok(output);
                    }
                }
                Err(e) => yield Err(e),
            }
        })
    }
}
