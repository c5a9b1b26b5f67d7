use anyhow::Result;
use colored::Colorize;

use appbox::RunOptions;

use super::open_session;

/// Runs a command in the session's sandbox and returns its exit code so the
/// CLI can propagate it. A failing command is a normal outcome here, not an
/// error.
pub async fn run(
    session_id: &str,
    command: &str,
    timeout_secs: Option<u64>,
    background: bool,
) -> Result<i32> {
    let (_registry, sandbox) = open_session(session_id).await?;

    let mut options = RunOptions::default();
    if let Some(secs) = timeout_secs {
        options = options.with_timeout(Some(secs));
    }
    if background {
        options = options.in_background();
    }

    let result = sandbox.run_command(command, options).await?;

    if result.background {
        let pid = result.pid.map(|p| p.to_string()).unwrap_or_default();
        println!("{} Started in background (pid {})", "✓".green(), pid.cyan());
        return Ok(0);
    }

    if !result.stdout.is_empty() {
        print!("{}", result.stdout);
    }
    if !result.stderr.is_empty() {
        eprint!("{}", result.stderr);
    }
    if !result.success {
        eprintln!(
            "{} Command exited with code {}",
            "✗".red(),
            result.exit_code.to_string().red()
        );
    }
    Ok(result.exit_code)
}
