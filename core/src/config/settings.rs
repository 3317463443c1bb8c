//! Model, provider and key settings
//!
//! A [`Settings`] value holds everything needed to build the two language models a
//! tree uses: the *base* model for decisions and light tools, and the *complex*
//! model for heavy tools such as query planning. It also carries the vector
//! database credentials and any other `*_API_KEY` found in the environment.

use super::types::{default_base_url, provider_root, ModelParams, Protocol, ResolvedLlmConfig};
use crate::error::{ConfigError, Result};
use crate::llm::{create_client, LlmClient};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;

/// Model, provider and credential settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub settings_id: String,
    pub base_model: Option<String>,
    pub base_provider: Option<String>,
    pub complex_model: Option<String>,
    pub complex_provider: Option<String>,
    pub model_api_base: Option<String>,
    #[serde(default)]
    pub wcd_url: String,
    #[serde(default)]
    pub wcd_api_key: String,
    /// Lowercased key name -> value
    #[serde(default)]
    pub api_keys: BTreeMap<String, String>,
    /// Minutes before an idle vector-database client is dropped
    #[serde(default = "default_client_timeout")]
    pub client_timeout: u64,
}

fn default_client_timeout() -> u64 {
    3
}

/// Partial update applied by [`Settings::configure`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigureOptions {
    pub base_model: Option<String>,
    pub base_provider: Option<String>,
    pub complex_model: Option<String>,
    pub complex_provider: Option<String>,
    pub model_api_base: Option<String>,
    pub wcd_url: Option<String>,
    pub wcd_api_key: Option<String>,
    /// Anything else is stored as an API key
    #[serde(flatten)]
    pub api_keys: BTreeMap<String, String>,
}

impl ConfigureOptions {
    pub fn base<M: Into<String>, P: Into<String>>(mut self, model: M, provider: P) -> Self {
        self.base_model = Some(model.into());
        self.base_provider = Some(provider.into());
        self
    }

    pub fn complex<M: Into<String>, P: Into<String>>(mut self, model: M, provider: P) -> Self {
        self.complex_model = Some(model.into());
        self.complex_provider = Some(provider.into());
        self
    }

    pub fn model_api_base<S: Into<String>>(mut self, api_base: S) -> Self {
        self.model_api_base = Some(api_base.into());
        self
    }

    pub fn api_key<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.api_keys.insert(key.into(), value.into());
        self
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            settings_id: uuid::Uuid::new_v4().to_string(),
            base_model: None,
            base_provider: None,
            complex_model: None,
            complex_provider: None,
            model_api_base: None,
            wcd_url: String::new(),
            wcd_api_key: String::new(),
            api_keys: BTreeMap::new(),
            client_timeout: default_client_timeout(),
        }
    }
}

fn is_api_key_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    (lower.ends_with("api_key") || lower.ends_with("apikey")) && lower != "wcd_api_key"
}

impl Settings {
    /// Empty settings with a fresh id
    pub fn new() -> Self {
        Self::default()
    }

    /// Settings from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_sources(None)
    }

    /// Settings from a JSON file, overridden by environment variables
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_sources(Some(path.as_ref().to_path_buf()))
    }

    fn from_sources(path: Option<PathBuf>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = &path {
            if !path.exists() {
                return Err(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
                .into());
            }
            builder = builder.add_source(
                config::File::from(path.as_path()).format(config::FileFormat::Json),
            );
        }
        let layered = builder
            .add_source(config::Environment::default())
            .build()
            .map_err(|e| ConfigError::InvalidFormat {
                message: e.to_string(),
            })?;

        let get = |key: &str| layered.get_string(key).ok().filter(|v| !v.is_empty());

        let mut settings = Self {
            base_model: get("base_model"),
            base_provider: get("base_provider"),
            complex_model: get("complex_model"),
            complex_provider: get("complex_provider"),
            model_api_base: get("model_api_base"),
            wcd_url: get("wcd_url").unwrap_or_default(),
            wcd_api_key: get("wcd_api_key").unwrap_or_default(),
            ..Self::default()
        };
        if let Some(timeout) = get("client_timeout") {
            settings.client_timeout =
                timeout.parse().map_err(|_| ConfigError::InvalidValue {
                    field: "client_timeout".to_string(),
                    value: timeout.clone(),
                })?;
        }

        // keys from the file first, the environment wins
        if let Ok(file_keys) = layered.get_table("api_keys") {
            for (key, value) in file_keys {
                if let Ok(value) = value.into_string() {
                    settings.api_keys.insert(key.to_lowercase(), value);
                }
            }
        }
        for (key, value) in std::env::vars() {
            if is_api_key_name(&key) {
                settings.api_keys.insert(key.to_lowercase(), value);
            }
        }

        tracing::debug!(
            "Loaded settings {} ({} API keys)",
            settings.settings_id,
            settings.api_keys.len()
        );
        Ok(settings)
    }

    /// Settings with the stock OpenRouter/Gemini models, then the environment on top
    pub fn from_default() -> Result<Self> {
        let mut settings = Self::from_env()?;
        settings.base_model.get_or_insert_with(|| "gemini-2.0-flash-001".to_string());
        settings.complex_model.get_or_insert_with(|| "gemini-2.0-flash-001".to_string());
        settings.base_provider.get_or_insert_with(|| "openrouter/google".to_string());
        settings.complex_provider.get_or_insert_with(|| "openrouter/google".to_string());
        Ok(settings)
    }

    /// Apply a partial update.
    ///
    /// A model must come with its provider, and `ollama` needs an API base
    /// either in the update or already set.
    pub fn configure(&mut self, options: ConfigureOptions) -> Result<()> {
        let api_base = options
            .model_api_base
            .clone()
            .or_else(|| self.model_api_base.clone())
            .filter(|base| !base.is_empty());

        let base = Self::check_pair(
            "base_model",
            options.base_model,
            options.base_provider,
            api_base.is_some(),
        )?;
        let complex = Self::check_pair(
            "complex_model",
            options.complex_model,
            options.complex_provider,
            api_base.is_some(),
        )?;

        if let Some((model, provider)) = base {
            self.base_model = Some(model);
            self.base_provider = Some(provider);
        }
        if let Some((model, provider)) = complex {
            self.complex_model = Some(model);
            self.complex_provider = Some(provider);
        }
        if let Some(api_base) = options.model_api_base {
            self.model_api_base = Some(api_base);
        }
        if let Some(wcd_url) = options.wcd_url {
            self.wcd_url = wcd_url;
        }
        if let Some(wcd_api_key) = options.wcd_api_key {
            self.wcd_api_key = wcd_api_key;
        }
        for (key, value) in options.api_keys {
            self.api_keys.insert(key.to_lowercase(), value);
        }
        Ok(())
    }

    fn check_pair(
        model_field: &str,
        model: Option<String>,
        provider: Option<String>,
        has_api_base: bool,
    ) -> Result<Option<(String, String)>> {
        let Some(model) = model else {
            return Ok(None);
        };
        let Some(provider) = provider else {
            return Err(ConfigError::MissingProvider {
                model_field: model_field.to_string(),
            }
            .into());
        };
        if provider == "ollama" && !has_api_base {
            return Err(ConfigError::MissingApiBase.into());
        }
        Ok(Some((model, provider)))
    }

    pub fn check_base_lm(&self) -> Result<()> {
        Self::check_model(&self.base_model, &self.base_provider, "base")
    }

    pub fn check_complex_lm(&self) -> Result<()> {
        Self::check_model(&self.complex_model, &self.complex_provider, "complex")
    }

    fn check_model(model: &Option<String>, provider: &Option<String>, which: &str) -> Result<()> {
        if model.as_deref().unwrap_or_default().is_empty() {
            return Err(ConfigError::MissingField {
                field: format!("{}_model", which),
            }
            .into());
        }
        if provider.as_deref().unwrap_or_default().is_empty() {
            return Err(ConfigError::MissingField {
                field: format!("{}_provider", which),
            }
            .into());
        }
        Ok(())
    }

    /// Whether vector-database credentials are present
    pub fn has_weaviate(&self) -> bool {
        !self.wcd_url.is_empty() && !self.wcd_api_key.is_empty()
    }

    /// API key for a provider, looked up as `{root}_api_key` then `{root}_apikey`
    pub fn api_key_for(&self, provider: &str) -> Option<&str> {
        let root = provider_root(provider).to_lowercase();
        self.api_keys
            .get(&format!("{}_api_key", root))
            .or_else(|| self.api_keys.get(&format!("{}_apikey", root)))
            .map(String::as_str)
    }

    /// Resolve a model/provider pair into a client configuration
    pub fn resolve(&self, model: &str, provider: &str) -> Result<ResolvedLlmConfig> {
        let root = provider_root(provider);

        let base_url = if root == "ollama" {
            let api_base = self
                .model_api_base
                .as_deref()
                .filter(|b| !b.is_empty())
                .ok_or(ConfigError::MissingApiBase)?;
            let api_base = api_base.trim_end_matches('/');
            if api_base.ends_with("/v1") {
                api_base.to_string()
            } else {
                format!("{}/v1", api_base)
            }
        } else if let Some(api_base) = self.model_api_base.as_deref().filter(|b| !b.is_empty()) {
            api_base.to_string()
        } else {
            default_base_url(provider)
                .ok_or_else(|| ConfigError::InvalidValue {
                    field: "provider".to_string(),
                    value: provider.to_string(),
                })?
                .to_string()
        };

        let api_key = match self.api_key_for(provider) {
            Some(key) => key.to_string(),
            // local servers accept any key
            None if root == "ollama" => "ollama".to_string(),
            None => {
                return Err(ConfigError::MissingField {
                    field: format!("{}_api_key", root),
                }
                .into())
            }
        };

        // openrouter/google + gemini-2.0 -> google/gemini-2.0
        let api_model = match provider.split_once('/') {
            Some((_, vendor)) => format!("{}/{}", vendor, model),
            None => model.to_string(),
        };

        Ok(ResolvedLlmConfig::new(
            provider,
            Protocol::from_provider(provider),
            base_url,
            api_key,
            api_model,
        )
        .with_params(ModelParams::for_model(model)))
    }

    pub fn base_lm_config(&self) -> Result<ResolvedLlmConfig> {
        self.check_base_lm()?;
        self.resolve(
            self.base_model.as_deref().unwrap_or_default(),
            self.base_provider.as_deref().unwrap_or_default(),
        )
    }

    pub fn complex_lm_config(&self) -> Result<ResolvedLlmConfig> {
        self.check_complex_lm()?;
        self.resolve(
            self.complex_model.as_deref().unwrap_or_default(),
            self.complex_provider.as_deref().unwrap_or_default(),
        )
    }

    /// Client for decisions and light tools
    pub fn base_lm(&self) -> Result<Arc<dyn LlmClient>> {
        create_client(&self.base_lm_config()?)
    }

    /// Client for heavy tools
    pub fn complex_lm(&self) -> Result<Arc<dyn LlmClient>> {
        create_client(&self.complex_lm_config()?)
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Default settings file under the user config directory
    pub fn default_config_path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push("grove");
        path.push("settings.json");
        path
    }

    /// Write settings to a JSON file
    pub async fn export_config<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?).await?;
        tracing::info!("Exported settings to {}", path.display());
        Ok(())
    }

    /// Replace these settings with a JSON file's contents
    pub async fn load_config<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.display().to_string(),
            }
            .into());
        }
        let content = fs::read_to_string(path).await?;
        *self = serde_json::from_str(&content).map_err(|e| ConfigError::InvalidFormat {
            message: e.to_string(),
        })?;
        Ok(())
    }
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |v: &Option<String>| v.clone().unwrap_or_else(|| "not set".to_string());
        writeln!(f, "Base model: {}", show(&self.base_model))?;
        writeln!(f, "Complex model: {}", show(&self.complex_model))?;
        writeln!(f, "Base provider: {}", show(&self.base_provider))?;
        writeln!(f, "Complex provider: {}", show(&self.complex_provider))?;
        writeln!(f, "Model API base: {}", show(&self.model_api_base))
    }
}
