use std::io::Read;

use anyhow::{Context, Result};
use colored::Colorize;

use super::open_session;

pub async fn run(session_id: &str, path: &str, content: Option<String>) -> Result<()> {
    let content = match content {
        Some(content) => content,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read content from stdin")?;
            buf
        }
    };

    let (_registry, sandbox) = open_session(session_id).await?;
    let receipt = sandbox.write_file(path, &content).await?;

    println!(
        "{} Wrote {} bytes to {}",
        "✓".green(),
        receipt.size.to_string().cyan(),
        receipt.path.cyan()
    );
    Ok(())
}
