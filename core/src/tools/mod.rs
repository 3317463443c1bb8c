//! Tool system and built-in tools

pub mod base;
pub mod builtin;
pub mod function;
pub mod registry;
pub mod retrieval;

pub use base::{InputSpec, Tool, ToolContext, ToolOutput, ToolSpec, ToolStream};
pub use function::FunctionTool;
pub use registry::{ToolFactory, ToolRegistry};
