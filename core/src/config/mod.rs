//! Settings and resolved model configuration
//!
//! Discovery of settings files happens in the CLI layer; core loads a given
//! file or the environment.

pub mod settings;
pub mod types;

pub use settings::{ConfigureOptions, Settings};
pub use types::{ModelParams, Protocol, ResolvedLlmConfig};
