pub mod destroy;
pub mod ls;
pub mod read;
pub mod run;
pub mod serve;
pub mod write;

use std::sync::Arc;

use anyhow::{Context, Result};

use appbox::{Config, Sandbox, SessionRegistry};

/// Loads the configuration from the working directory and resolves the
/// session's sandbox handle.
pub(crate) async fn open_session(session_id: &str) -> Result<(SessionRegistry, Arc<dyn Sandbox>)> {
    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    let config = Config::load(&cwd)?;
    let registry = SessionRegistry::new(config);
    let sandbox = registry.get_or_create(session_id).await?;
    Ok((registry, sandbox))
}
