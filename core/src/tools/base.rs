//! Base tool traits and structures

use crate::error::{Result, ToolError};
use crate::llm::LlmClient;
use crate::output::{JsonObject, Text, ToolResult, TreeUpdate, Update};
use crate::tree::TreeData;
use crate::weaviate::ClientManager;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Stream of outputs produced by one tool call
pub type ToolStream = BoxStream<'static, Result<ToolOutput>>;

/// Trait for all tools
#[async_trait]
pub trait Tool: Send + Sync {
    /// Static description of the tool: name, inputs, status text
    fn spec(&self) -> &ToolSpec;

    /// Get the name of the tool
    fn name(&self) -> &str {
        &self.spec().name
    }

    /// Get the description of the tool
    fn description(&self) -> &str {
        &self.spec().description
    }

    /// `{input: default}` for every declared input
    fn get_default_inputs(&self) -> JsonObject {
        self.spec().default_inputs()
    }

    /// Whether the decision agent may pick this tool right now
    async fn is_tool_available(&self, _tree_data: &TreeData, _client: &ClientManager) -> bool {
        true
    }

    /// Checked at every decision node before the agent is asked.
    /// Returning true runs the tool straight away with the returned inputs.
    async fn run_if_true(&self, _tree_data: &TreeData, _client: &ClientManager) -> (bool, JsonObject) {
        (false, JsonObject::new())
    }

    /// Run the tool
    fn call(&self, ctx: ToolContext) -> ToolStream;
}

/// Declared input of a tool, as shown to the decision agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSpec {
    pub description: String,
    #[serde(rename = "type")]
    pub input_type: String,
    #[serde(default)]
    pub default: Value,
    #[serde(default)]
    pub required: bool,
}

impl InputSpec {
    pub fn new<D: Into<String>, T: Into<String>>(description: D, input_type: T) -> Self {
        Self {
            description: description.into(),
            input_type: input_type.into(),
            default: Value::Null,
            required: false,
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = default;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Name, description and inputs of a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// Shown to the user while the tool runs
    pub status: String,
    pub inputs: BTreeMap<String, InputSpec>,
    /// Whether the tree may finish after this tool
    pub end: bool,
    /// Told to the agent when the tool is unavailable
    #[serde(default)]
    pub available_at: String,
}

impl ToolSpec {
    pub fn new<N: Into<String>, D: Into<String>>(name: N, description: D) -> Self {
        let name = name.into();
        Self {
            status: format!("Running {}...", name),
            name,
            description: description.into(),
            inputs: BTreeMap::new(),
            end: false,
            available_at: String::new(),
        }
    }

    pub fn with_status<S: Into<String>>(mut self, status: S) -> Self {
        self.status = status.into();
        self
    }

    pub fn with_input<S: Into<String>>(mut self, name: S, input: InputSpec) -> Self {
        self.inputs.insert(name.into(), input);
        self
    }

    pub fn with_end(mut self, end: bool) -> Self {
        self.end = end;
        self
    }

    pub fn with_available_at<S: Into<String>>(mut self, available_at: S) -> Self {
        self.available_at = available_at.into();
        self
    }

    pub fn default_inputs(&self) -> JsonObject {
        self.inputs
            .iter()
            .map(|(name, input)| (name.clone(), input.default.clone()))
            .collect()
    }

    /// Input schema in the shape given to the decision agent
    pub fn inputs_json(&self) -> Value {
        serde_json::to_value(&self.inputs).unwrap_or(Value::Null)
    }
}

/// Everything a tool call gets to work with
#[derive(Clone)]
pub struct ToolContext {
    /// Snapshot of the tree state when the tool was chosen
    pub tree_data: Arc<TreeData>,
    pub inputs: JsonObject,
    pub base_lm: Arc<dyn LlmClient>,
    pub complex_lm: Arc<dyn LlmClient>,
    pub client_manager: Arc<ClientManager>,
}

impl ToolContext {
    pub fn new(
        tree_data: Arc<TreeData>,
        inputs: JsonObject,
        base_lm: Arc<dyn LlmClient>,
        complex_lm: Arc<dyn LlmClient>,
        client_manager: Arc<ClientManager>,
    ) -> Self {
        Self {
            tree_data,
            inputs,
            base_lm,
            complex_lm,
            client_manager,
        }
    }

    /// Get an input value by key
    pub fn get_input<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .inputs
            .get(key)
            .ok_or_else(|| ToolError::InvalidParameters {
                message: format!("Missing input: {}", key),
            })?;

        serde_json::from_value(value.clone()).map_err(|_| {
            ToolError::InvalidParameters {
                message: format!("Invalid input type for: {}", key),
            }
            .into()
        })
    }

    /// String input, empty when missing or null
    pub fn input_str(&self, key: &str) -> String {
        match self.inputs.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    }
}

/// One item yielded by a tool
#[derive(Debug, Clone)]
pub enum ToolOutput {
    Result(ToolResult),
    Text(Text),
    Update(Update),
    TreeUpdate(TreeUpdate),
}

impl ToolOutput {
    pub fn response<S: Into<String>>(text: S) -> Self {
        ToolOutput::Text(Text::response(text))
    }

    pub fn status<S: Into<String>>(text: S) -> Self {
        ToolOutput::Update(Update::status(text))
    }

    pub fn error<S: Into<String>>(text: S) -> Self {
        ToolOutput::Update(Update::error(text))
    }
}

impl From<ToolResult> for ToolOutput {
    fn from(result: ToolResult) -> Self {
        ToolOutput::Result(result)
    }
}

impl From<Text> for ToolOutput {
    fn from(text: Text) -> Self {
        ToolOutput::Text(text)
    }
}

impl From<Update> for ToolOutput {
    fn from(update: Update) -> Self {
        ToolOutput::Update(update)
    }
}
