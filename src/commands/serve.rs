use anyhow::{Context, Result};
use colored::Colorize;

use super::open_session;

/// Starts the dev server, prints the preview URL, and keeps the process
/// alive until Ctrl-C. On exit the session is destroyed so no server or
/// background process outlives the command; files are kept.
pub async fn run(session_id: &str, project_dir: &str, port: Option<u16>) -> Result<()> {
    let (registry, sandbox) = open_session(session_id).await?;

    let server = sandbox.start_dev_server(project_dir, port).await?;

    println!("\n{}", "━".repeat(50).dimmed());
    if server.reused {
        println!("{}", "   Dev server already running".yellow().bold());
    } else {
        println!("{}", "   Dev server started".green().bold());
    }
    println!("{}", "━".repeat(50).dimmed());
    println!("  Preview:  {}", server.preview_url.cyan().underline());
    println!("  Port:     {}", server.port.to_string().cyan());
    println!("  Pid:      {}", server.pid.to_string().cyan());
    println!("{}", "━".repeat(50).dimmed());
    println!("\nPress {} to stop", "Ctrl-C".yellow());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    println!("\n{} Shutting down...", "ℹ".blue());
    registry.remove(session_id, false).await;
    println!("{} Dev server stopped", "✓".green());
    Ok(())
}
