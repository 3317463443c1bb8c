//! # grove CLI
//!
//! Command-line interface for Grove - an agentic decision-tree engine.
//!
//! ## Usage
//!
//! - `grove "question"` - Run one query through a decision tree
//! - `grove tools` - Show the built-in tools

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod config;
mod output;

use commands::{run_command, tools_command, RunOptions};
use config::CliConfigLoader;

/// grove - ask questions of your data through a decision tree
#[derive(Parser)]
#[command(name = "grove")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "An agentic decision-tree engine written in Rust")]
#[command(long_about = None)]
struct Cli {
    /// Settings file or directory path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Base model override (decisions and light tools)
    #[arg(long)]
    base_model: Option<String>,

    /// Base model provider override
    #[arg(long)]
    base_provider: Option<String>,

    /// Complex model override (query planning and aggregation)
    #[arg(long)]
    complex_model: Option<String>,

    /// Complex model provider override
    #[arg(long)]
    complex_provider: Option<String>,

    /// API base for local or proxied models (required for ollama)
    #[arg(long)]
    model_api_base: Option<String>,

    /// Collection to search; repeat for several, omit for all
    #[arg(long = "collection")]
    collections: Vec<String>,

    /// Branch layout: default, one_branch, multi_branch or empty
    #[arg(long)]
    branch_init: Option<String>,

    /// `/`-separated list of options to take instead of asking the model
    #[arg(long)]
    training_route: Option<String>,

    /// Write the query history to this JSON file
    #[arg(long)]
    history_file: Option<PathBuf>,

    /// Save the tree to this file after the query
    #[arg(long)]
    export: Option<PathBuf>,

    /// Continue a conversation from a previously exported tree
    #[arg(long)]
    import: Option<PathBuf>,

    /// Writing style of the agent
    #[arg(long)]
    style: Option<String>,

    /// Description of the agent
    #[arg(long)]
    agent_description: Option<String>,

    /// What the agent should achieve before stopping
    #[arg(long)]
    end_goal: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// The question to ask
    prompt: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show available tools
    Tools,
}

/// Build a configuration loader from CLI arguments
fn build_config_loader(cli: &Cli) -> CliConfigLoader {
    let mut loader = CliConfigLoader::new();

    if let Some(config_path) = &cli.config {
        loader = loader.with_config_override(config_path.clone());
    }
    if let Some(model) = &cli.base_model {
        loader = loader.with_base_model_override(model.clone());
    }
    if let Some(provider) = &cli.base_provider {
        loader = loader.with_base_provider_override(provider.clone());
    }
    if let Some(model) = &cli.complex_model {
        loader = loader.with_complex_model_override(model.clone());
    }
    if let Some(provider) = &cli.complex_provider {
        loader = loader.with_complex_provider_override(provider.clone());
    }
    if let Some(api_base) = &cli.model_api_base {
        loader = loader.with_model_api_base_override(api_base.clone());
    }

    loader
}

fn build_run_options(cli: &Cli) -> RunOptions {
    RunOptions {
        collections: cli.collections.clone(),
        branch_init: cli.branch_init.clone(),
        training_route: cli.training_route.clone(),
        history_file: cli.history_file.clone(),
        export: cli.export.clone(),
        import: cli.import.clone(),
        style: cli.style.clone(),
        agent_description: cli.agent_description.clone(),
        end_goal: cli.end_goal.clone(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "grove_core=debug,grove_cli=debug,info"
    } else {
        "warn"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config_loader = build_config_loader(&cli);
    let run_options = build_run_options(&cli);

    match (cli.prompt, cli.command) {
        (Some(prompt), None) => run_command(prompt, config_loader, run_options).await,
        (Some(_), Some(_)) => {
            tracing::error!("Cannot specify both a prompt and a subcommand");
            std::process::exit(2);
        }
        (None, Some(Commands::Tools)) => tools_command().await,
        (None, None) => {
            eprintln!("Nothing to do. Pass a prompt, e.g. grove \"What is in my data?\", or see grove --help");
            std::process::exit(2);
        }
    }
}
