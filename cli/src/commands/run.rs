//! Single query execution command

use crate::output::CliOutputHandler;
use anyhow::{Context, Result};
use futures::StreamExt;
use grove_core::{BranchInitialisation, ClientManager, ProcessRequest, Settings, Tree};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Per-query flags
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub collections: Vec<String>,
    pub branch_init: Option<String>,
    pub training_route: Option<String>,
    pub history_file: Option<PathBuf>,
    pub export: Option<PathBuf>,
    pub import: Option<PathBuf>,
    pub style: Option<String>,
    pub agent_description: Option<String>,
    pub end_goal: Option<String>,
}

fn expand(path: &std::path::Path) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(raw.as_ref()).into_owned())
}

/// Imported trees keep their own models unless the loader produced some
async fn build_tree(settings: Settings, options: &RunOptions) -> Result<Tree> {
    let mut tree = match &options.import {
        Some(path) => {
            let path = expand(path);
            info!("Importing tree from {}", path.display());
            let mut tree = Tree::import_from_file(&path)
                .await
                .with_context(|| format!("Failed to import tree from {}", path.display()))?;
            if settings.base_model.is_some() || tree.settings().base_model.is_none() {
                tree.set_settings(settings);
            }
            tree
        }
        None => {
            let initialisation = match &options.branch_init {
                Some(name) => name.parse::<BranchInitialisation>()?,
                None => BranchInitialisation::Default,
            };
            Tree::new(settings)
                .with_ids("grove-cli", uuid::Uuid::new_v4().to_string())
                .with_initialisation(initialisation)
        }
    };

    if options.import.is_some() {
        if let Some(name) = &options.branch_init {
            tree.set_branch_initialisation(name)?;
        }
    }

    let client_manager = Arc::new(ClientManager::from_settings(tree.settings()));
    tree = tree.with_client_manager(client_manager);

    if let Some(style) = &options.style {
        tree.change_style(style.clone());
    }
    if let Some(agent_description) = &options.agent_description {
        tree.change_agent_description(agent_description.clone());
    }
    if let Some(end_goal) = &options.end_goal {
        tree.change_end_goal(end_goal.clone());
    }
    if let Some(path) = &options.history_file {
        tree = tree.with_history_file(expand(path));
    }

    Ok(tree)
}

/// Run one prompt through a tree and print what it streams back
pub async fn run_command(
    prompt: String,
    config_loader: crate::config::CliConfigLoader,
    options: RunOptions,
) -> Result<()> {
    info!("Running query: {}", prompt);

    let settings = config_loader.load().await?;
    let mut tree = build_tree(settings, &options).await?;

    tree.settings().check_base_lm().context(
        "No base model configured. Set BASE_MODEL and BASE_PROVIDER, pass --base-model and --base-provider, or add them to a settings file",
    )?;
    debug!(
        "Using base model {:?} via {:?}",
        tree.settings().base_model,
        tree.settings().base_provider
    );

    let mut request = ProcessRequest::new(prompt);
    if !options.collections.is_empty() {
        request = request.with_collection_names(options.collections.clone());
    }
    if let Some(route) = &options.training_route {
        request = request.with_training_route(route.clone());
    }

    let mut handler = CliOutputHandler::new();
    let mut failure = None;
    {
        let mut stream = tree.process(request);
        while let Some(item) = stream.next().await {
            match item {
                Ok(payload) => handler.handle(&payload),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
    }
    handler.finish();
    debug!("{} results shown", handler.results_shown());

    if let Some(e) = failure {
        return Err(anyhow::Error::new(e).context("Query failed"));
    }

    if let Some(path) = &options.export {
        let path = expand(path);
        tree.export_to_file(&path)
            .await
            .with_context(|| format!("Failed to export tree to {}", path.display()))?;
        info!("Tree exported to {}", path.display());
    }

    Ok(())
}
