//! Error types and handling for Grove Core

use thiserror::Error;

/// Result type alias for Grove operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Grove Core
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// LLM client errors
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    /// Tool execution errors
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    /// Decision tree errors
    #[error("Tree error: {0}")]
    Tree(#[from] TreeError),

    /// Tree/user manager errors
    #[error("Manager error: {0}")]
    Manager(#[from] ManagerError),

    /// Vector database client errors
    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    /// History recording errors
    #[error("History error: {0}")]
    History(#[from] HistoryError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Prompt template errors
    #[error("Template error: {0}")]
    Template(#[from] handlebars::RenderError),

    /// Timeout errors
    #[error("Timeout error: {0}")]
    Timeout(#[from] tokio::time::error::Elapsed),

    /// Generic error with message
    #[error("{0}")]
    Generic(String),
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for field '{field}': {value}")]
    InvalidValue { field: String, value: String },

    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid configuration format: {message}")]
    InvalidFormat { message: String },

    #[error("Provider must be specified if {model_field} is set")]
    MissingProvider { model_field: String },

    #[error("Using local models via ollama requires MODEL_API_BASE to be set")]
    MissingApiBase,
}

/// LLM client errors
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    #[error("Rate limit exceeded")]
    RateLimit,

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Could not parse model output: {message}")]
    InvalidOutput { message: String },
}

/// Tool execution errors
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Tool not found: {name}")]
    NotFound { name: String },

    #[error("Tool execution failed: {name} - {message}")]
    ExecutionFailed { name: String, message: String },

    #[error("Invalid tool parameters: {message}")]
    InvalidParameters { message: String },

    #[error("Tool unavailable: {name}")]
    Unavailable { name: String },
}

/// Decision tree errors
#[derive(Error, Debug)]
pub enum TreeError {
    #[error("Branch not found: {branch_id}")]
    BranchNotFound { branch_id: String },

    #[error("No root branch found")]
    NoRoot,

    #[error("Multiple root branches found: {first} and {second}")]
    MultipleRoots { first: String, second: String },

    #[error("Invalid branch: {message}")]
    InvalidBranch { message: String },

    #[error("Unknown branch initialisation: {name}")]
    UnknownInitialisation { name: String },

    #[error("Next node in training route ({step}) not in possible nodes ({options:?})")]
    InvalidRoute { step: String, options: Vec<String> },

    #[error("Decision agent chose '{function_name}', which is not an available option at '{node}'")]
    InvalidDecision { node: String, function_name: String },

    #[error("No available options at decision node '{node}'")]
    NoOptions { node: String },

    #[error("Invalid tree export: {message}")]
    InvalidExport { message: String },
}

/// Tree and user manager errors
#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("User not found: {user_id}")]
    UserNotFound { user_id: String },

    #[error("Tree not found: {conversation_id}")]
    TreeNotFound { conversation_id: String },
}

/// Vector database client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Vector database client is not configured (WCD_URL/WCD_API_KEY missing)")]
    NotConfigured,

    #[error("Vector database request failed: {status} - {message}")]
    Request { status: u16, message: String },

    #[error("Vector database query error: {message}")]
    Query { message: String },

    #[error("Vector database client has been closed")]
    Closed,
}

/// History recording errors
#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("Failed to record history: {message}")]
    RecordingFailed { message: String },

    #[error("Failed to load history: {path}")]
    LoadFailed { path: String },

    #[error("Invalid history format")]
    InvalidFormat,
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Generic(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Generic(msg.to_string())
    }
}
