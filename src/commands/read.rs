use anyhow::Result;

use super::open_session;

pub async fn run(session_id: &str, path: &str) -> Result<()> {
    let (_registry, sandbox) = open_session(session_id).await?;
    let content = sandbox.read_file(path).await?;
    print!("{content}");
    Ok(())
}
