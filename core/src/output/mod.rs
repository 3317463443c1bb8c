//! Values produced by tools and the tree, and their frontend envelopes
//!
//! Tools yield [`ToolResult`]s (displayed objects that also enter the environment),
//! [`Text`] (assistant speech) and [`Update`]s (status, warnings, errors). The tree
//! wraps all of them in a [`FrontendPayload`] before handing them to the caller.

pub mod frontend;
pub mod result;
pub mod text;
pub mod update;

pub use frontend::{FrontendPayload, FrontendReturner};
pub use result::{ResultKind, ToolResult};
pub use text::Text;
pub use update::{TreeUpdate, Update};

/// A JSON record, the unit stored in the environment
pub type JsonObject = serde_json::Map<String, serde_json::Value>;

/// Make a frontend id of the form `"{type[:3]}-{uuid}"`
pub(crate) fn frontend_id(frontend_type: &str) -> String {
    let prefix: String = frontend_type.chars().take(3).collect();
    format!("{}-{}", prefix, uuid::Uuid::new_v4())
}
