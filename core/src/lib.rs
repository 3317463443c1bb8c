//! # Grove Core
//!
//! Core library for Grove - an agentic decision-tree engine.
//!
//! A [`Tree`] answers a user prompt by walking branches of decisions. At each
//! branch an LLM picks a tool or a sub-branch; tools retrieve or aggregate data
//! from a vector database, summarise, or reply in text. Everything they return
//! is kept in a shared environment that later decisions can see, and errors
//! are fed back so the agent can correct itself.

// Core modules
pub mod config;
pub mod error;
pub mod history;
pub mod llm;
pub mod manager;
pub mod output;
pub mod prompts;
pub mod tools;
pub mod tree;
pub mod weaviate;

// Re-export commonly used types
pub use config::{ConfigureOptions, Settings};
pub use error::{Error, Result};
pub use history::{HistoryRecorder, QueryHistory};
pub use manager::{ManagerConfig, TreeManager, TreeOptions, UserManager};
pub use output::{FrontendPayload, Text, ToolResult, Update};
pub use tools::{Tool, ToolContext, ToolOutput, ToolRegistry, ToolSpec};
pub use tree::{BranchInitialisation, BranchSpec, ProcessRequest, Tree, TreeData};
pub use weaviate::ClientManager;

/// Current version of the grove-core library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize tracing for the library
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}

/// Initialize tracing with a specific debug mode
pub fn init_tracing_with_debug(debug: bool) {
    let filter = if debug { "grove_core=debug,info" } else { "info" };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();
}
