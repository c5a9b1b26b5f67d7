use anyhow::Result;
use colored::Colorize;

use super::open_session;

pub async fn run(session_id: &str, path: &str) -> Result<()> {
    let (_registry, sandbox) = open_session(session_id).await?;
    let names = sandbox.list_files(path).await?;

    if names.is_empty() {
        println!("{} {} is empty", "ℹ".blue(), path.cyan());
        return Ok(());
    }
    for name in names {
        println!("{name}");
    }
    Ok(())
}
