use anyhow::Result;
use colored::Colorize;

use super::open_session;

pub async fn run(session_id: &str, keep_files: bool) -> Result<()> {
    let (_registry, sandbox) = open_session(session_id).await?;

    // Provision first so a destroy issued from a fresh process finds the
    // session's directory and can delete it.
    if !keep_files {
        sandbox.ensure().await?;
    }
    sandbox.destroy(!keep_files).await?;

    if keep_files {
        println!(
            "{} Session {} destroyed (files kept)",
            "✓".green(),
            session_id.cyan()
        );
    } else {
        println!("{} Session {} destroyed", "✓".green(), session_id.cyan());
    }
    Ok(())
}
