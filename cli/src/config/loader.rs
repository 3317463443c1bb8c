//! CLI settings loader for grove
//!
//! Loads settings from the first source found, then applies flag overrides:
//! 1. --config file/dir (highest priority)
//! 2. Current working directory: ./grove.json or ./.grove/settings.json
//! 3. Git repository root: <repo_root>/.grove/settings.json
//! 4. User config dir: $XDG_CONFIG_HOME/grove/settings.json (or the platform equivalent)
//! 5. Environment variables only (no files)
//!
//! Environment variables are layered over whichever file is used.

use anyhow::{anyhow, Context, Result};
use grove_core::{ConfigureOptions, Settings};
use std::path::{Path, PathBuf};
use tracing::debug;

const CWD_FILE: &str = "grove.json";
const DIR_NAME: &str = ".grove";
const FILE_NAME: &str = "settings.json";

/// CLI settings loader
#[derive(Debug, Default)]
pub struct CliConfigLoader {
    /// Override settings file/directory path
    config_override: Option<PathBuf>,
    base_model_override: Option<String>,
    base_provider_override: Option<String>,
    complex_model_override: Option<String>,
    complex_provider_override: Option<String>,
    model_api_base_override: Option<String>,
}

impl CliConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config_override(mut self, path: PathBuf) -> Self {
        self.config_override = Some(path);
        self
    }

    pub fn with_base_model_override(mut self, model: String) -> Self {
        self.base_model_override = Some(model);
        self
    }

    pub fn with_base_provider_override(mut self, provider: String) -> Self {
        self.base_provider_override = Some(provider);
        self
    }

    pub fn with_complex_model_override(mut self, model: String) -> Self {
        self.complex_model_override = Some(model);
        self
    }

    pub fn with_complex_provider_override(mut self, provider: String) -> Self {
        self.complex_provider_override = Some(provider);
        self
    }

    pub fn with_model_api_base_override(mut self, api_base: String) -> Self {
        self.model_api_base_override = Some(api_base);
        self
    }

    /// Load settings and apply the flag overrides
    pub async fn load(&self) -> Result<Settings> {
        let mut settings = match &self.config_override {
            Some(override_path) => {
                let path = expand_path(override_path);
                self.load_from_path(&path).with_context(|| {
                    format!("Failed to load settings from override path: {}", path.display())
                })?
            }
            None => self.search_and_load()?,
        };

        self.apply_overrides(&mut settings)?;
        Ok(settings)
    }

    fn search_and_load(&self) -> Result<Settings> {
        let cwd = std::env::current_dir()?;

        let mut candidates = vec![cwd.join(CWD_FILE), cwd.join(DIR_NAME).join(FILE_NAME)];
        if let Some(git_root) = find_git_root(&cwd) {
            candidates.push(git_root.join(DIR_NAME).join(FILE_NAME));
        }
        if let Some(config_dir) = xdg_config_dir() {
            candidates.push(config_dir.join("grove").join(FILE_NAME));
        }

        for candidate in candidates {
            if candidate.is_file() {
                debug!("Loading settings from {}", candidate.display());
                return load_file(&candidate);
            }
        }

        debug!("No settings file found, using environment variables only");
        Settings::from_env().context("Failed to read settings from the environment")
    }

    /// A file, or a directory holding `settings.json`
    fn load_from_path(&self, path: &Path) -> Result<Settings> {
        if path.is_file() {
            load_file(path)
        } else if path.is_dir() {
            let file = path.join(FILE_NAME);
            if file.exists() {
                load_file(&file)
            } else {
                Err(anyhow!("No {} found in directory: {}", FILE_NAME, path.display()))
            }
        } else {
            Err(anyhow!("Settings path does not exist: {}", path.display()))
        }
    }

    /// A model flag without a provider flag reuses the provider already set
    fn apply_overrides(&self, settings: &mut Settings) -> Result<()> {
        let pair = |model: &Option<String>,
                    provider: &Option<String>,
                    current_model: &Option<String>,
                    current_provider: &Option<String>| {
            if model.is_none() && provider.is_none() {
                return (None, None);
            }
            (
                model.clone().or_else(|| current_model.clone()),
                provider.clone().or_else(|| current_provider.clone()),
            )
        };

        let (base_model, base_provider) = pair(
            &self.base_model_override,
            &self.base_provider_override,
            &settings.base_model,
            &settings.base_provider,
        );
        let (complex_model, complex_provider) = pair(
            &self.complex_model_override,
            &self.complex_provider_override,
            &settings.complex_model,
            &settings.complex_provider,
        );

        let options = ConfigureOptions {
            base_model,
            base_provider,
            complex_model,
            complex_provider,
            model_api_base: self.model_api_base_override.clone(),
            ..Default::default()
        };
        settings
            .configure(options)
            .map_err(|e| anyhow!("Invalid model override: {}", e))
    }
}

fn load_file(path: &Path) -> Result<Settings> {
    Settings::from_file(path)
        .with_context(|| format!("Failed to load settings file: {}", path.display()))
}

fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(raw.as_ref()).into_owned())
}

fn find_git_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(".git").exists())
        .map(Path::to_path_buf)
}

fn xdg_config_dir() -> Option<PathBuf> {
    std::env::var_os("XDG_CONFIG_HOME")
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .or_else(dirs::config_dir)
}
