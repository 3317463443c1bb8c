//! Tools listing command

use anyhow::Result;
use colored::Colorize;
use grove_core::ToolRegistry;
use tracing::info;

/// Show the built-in tools
pub async fn tools_command() -> Result<()> {
    info!("Listing available tools");

    println!("{}\n", "Available Tools".bold());

    let registry = ToolRegistry::default();
    for name in registry.list_tools() {
        if let Some((tool_name, description)) = registry.get_tool_info(name) {
            println!("  {}", tool_name.cyan());
            // first line only
            let first_line = description.lines().next().unwrap_or(description);
            println!("    {}\n", first_line);
        }
    }

    println!(
        "{}",
        "query and aggregate need a vector database (WCD_URL, WCD_API_KEY).".dimmed()
    );

    Ok(())
}
