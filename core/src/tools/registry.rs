//! Tool registry for managing available tools

use crate::tools::Tool;
use std::collections::HashMap;
use std::sync::Arc;

/// Registry for managing tool creation and registration
pub struct ToolRegistry {
    factories: HashMap<String, Box<dyn ToolFactory>>,
}

/// Factory trait for creating tools
pub trait ToolFactory: Send + Sync {
    /// Create a new instance of the tool
    fn create(&self) -> Arc<dyn Tool>;

    /// Get the name of the tool this factory creates
    fn tool_name(&self) -> &str;

    /// Get the description of the tool this factory creates
    fn tool_description(&self) -> &str;
}

impl ToolRegistry {
    /// Create an empty tool registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a tool factory
    pub fn register_factory(&mut self, factory: Box<dyn ToolFactory>) {
        self.factories.insert(factory.tool_name().to_string(), factory);
    }

    /// Create a tool by name
    pub fn create_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.factories.get(name).map(|factory| factory.create())
    }

    /// All registered tool names, sorted
    pub fn list_tools(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Get tool information
    pub fn get_tool_info(&self, name: &str) -> Option<(&str, &str)> {
        self.factories
            .get(name)
            .map(|factory| (factory.tool_name(), factory.tool_description()))
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        let mut registry = Self::new();

        registry.register_factory(Box::new(crate::tools::builtin::TextResponseToolFactory));
        registry.register_factory(Box::new(crate::tools::builtin::FinalTextResponseToolFactory));
        registry.register_factory(Box::new(crate::tools::builtin::SummarizeToolFactory));
        registry.register_factory(Box::new(crate::tools::retrieval::QueryToolFactory));
        registry.register_factory(Box::new(crate::tools::retrieval::AggregateToolFactory));

        registry
    }
}

/// Macro to help implement tool factories
#[macro_export]
macro_rules! impl_tool_factory {
    ($factory:ident, $tool:ident, $name:expr, $description:expr) => {
        pub struct $factory;

        impl $crate::tools::ToolFactory for $factory {
            fn create(&self) -> std::sync::Arc<dyn $crate::tools::Tool> {
                std::sync::Arc::new($tool::new())
            }

            fn tool_name(&self) -> &str {
                $name
            }

            fn tool_description(&self) -> &str {
                $description
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use crate::tools::registry::ToolRegistry;

    const EXPECTED_TOOLS: [&str; 5] = [
        "aggregate",
        "final_text_response",
        "query",
        "summarize",
        "text_response",
    ];

    #[test]
    fn test_default_registry_has_all_tools() {
        let registry = ToolRegistry::default();
        let tools = registry.list_tools();

        assert_eq!(
            tools,
            EXPECTED_TOOLS.to_vec(),
            "Expected {:?}, found {:?}",
            EXPECTED_TOOLS,
            tools
        );
    }

    #[test]
    fn test_tool_creation() {
        let registry = ToolRegistry::default();

        for tool_name in EXPECTED_TOOLS {
            let tool = registry
                .create_tool(tool_name)
                .unwrap_or_else(|| panic!("Failed to create tool '{}'", tool_name));

            assert_eq!(tool.name(), tool_name, "Tool name mismatch for '{}'", tool_name);
            assert!(
                !tool.description().is_empty(),
                "Tool '{}' has empty description",
                tool_name
            );
            assert!(
                tool.spec().status.ends_with("..."),
                "Tool '{}' has no status text",
                tool_name
            );
        }
        assert!(registry.create_tool("bash").is_none());
    }

    #[test]
    fn test_tool_info() {
        let registry = ToolRegistry::default();

        for tool_name in registry.list_tools() {
            let (name, description) = registry.get_tool_info(tool_name).unwrap();
            assert_eq!(name, tool_name);
            assert!(!description.is_empty());
        }
    }

    #[test]
    fn test_end_flags() {
        let registry = ToolRegistry::default();
        let ends = |name: &str| registry.create_tool(name).unwrap().spec().end;

        assert!(ends("text_response"));
        assert!(ends("summarize"));
        assert!(!ends("query"));
        assert!(!ends("aggregate"));
    }
}
