//! Sandboxed execution environments for app-builder sessions.
//!
//! Each session owns one isolated filesystem root, at most one allocated
//! dev-server port, and at most one dev-server process. Two backends
//! implement the same contract:
//! - Local: a directory on the host filesystem plus OS processes
//! - Remote: a VM sandbox managed by an external provider over HTTP
//!
//! The backend is selected once per session by [`create_sandbox`] based on
//! `[sandbox].mode` in the configuration.

mod error;
mod local;
mod path;
mod port;
mod process;
mod remote;

pub use error::SandboxError;
pub use local::LocalSandbox;
pub use port::DEFAULT_START_PORT;
pub use remote::RemoteSandbox;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::Config;

/// Default foreground command timeout in seconds.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 120;

/// Options for [`Sandbox::run_command`].
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Timeout for foreground execution. `None` or `Some(0)` disables the
    /// timeout. Ignored in background mode.
    pub timeout_secs: Option<u64>,
    /// Spawn detached and return after a short grace period instead of
    /// waiting for exit. Output is not captured; long-running servers
    /// should redirect to a file themselves.
    pub background: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            timeout_secs: Some(DEFAULT_COMMAND_TIMEOUT_SECS),
            background: false,
        }
    }
}

impl RunOptions {
    /// Sets the foreground timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout_secs: Option<u64>) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Switches to background mode.
    #[must_use]
    pub fn in_background(mut self) -> Self {
        self.background = true;
        self
    }

    /// The effective timeout: `0` is normalized to "no timeout".
    pub(crate) fn effective_timeout(&self) -> Option<u64> {
        match self.timeout_secs {
            Some(0) | None => None,
            Some(secs) => Some(secs),
        }
    }
}

/// Result of a completed (or backgrounded) command.
///
/// A non-zero exit code is normal data here, not an error: callers such as
/// a build-then-fix loop branch on `success` without exception handling.
#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    /// Captured standard output (empty in background mode).
    pub stdout: String,
    /// Captured standard error (empty in background mode).
    pub stderr: String,
    /// Process exit code; 0 for background spawns.
    pub exit_code: i32,
    /// True iff the exit code was zero.
    pub success: bool,
    /// True if the command was spawned in background mode.
    pub background: bool,
    /// Pid of the detached process, background mode only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// Receipt for a successful file write.
#[derive(Debug, Clone, Serialize)]
pub struct WriteReceipt {
    /// Resolved path the content was written to.
    pub path: String,
    /// Number of UTF-8 bytes written.
    pub size: usize,
}

/// A running development server.
#[derive(Debug, Clone, Serialize)]
pub struct DevServer {
    /// Externally reachable address of the server.
    pub preview_url: String,
    /// Port the server is bound to. Stable for the session's lifetime.
    pub port: u16,
    /// Pid of the server process.
    pub pid: u32,
    /// True when an already-running server was returned instead of
    /// spawning a duplicate.
    pub reused: bool,
}

/// Capability contract for one sandbox session.
///
/// All operations lazily initialize the sandbox on first use; `destroy` is
/// idempotent and safe to call on a session that was never initialized.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Backend name for display ("local" or "remote").
    fn name(&self) -> &'static str;

    /// The caller-supplied session identifier.
    fn session_id(&self) -> &str;

    /// True once provisioning has succeeded and before `destroy`.
    fn is_initialized(&self) -> bool;

    /// Backend identifier: the session id for local sandboxes, the
    /// provider's sandbox id for remote ones. `None` until initialized.
    fn sandbox_id(&self) -> Option<String>;

    /// Preview URL for the allocated port, if one has been allocated.
    fn preview_url(&self) -> Option<String>;

    /// Provisions the sandbox if needed. Idempotent; concurrent callers
    /// are serialized so exactly one provisioning sequence runs.
    async fn ensure(&self) -> Result<(), SandboxError>;

    /// Writes UTF-8 content, creating parent directories as needed.
    async fn write_file(&self, path: &str, content: &str) -> Result<WriteReceipt, SandboxError>;

    /// Reads a file as UTF-8 text.
    async fn read_file(&self, path: &str) -> Result<String, SandboxError>;

    /// Lists the immediate children of a directory (names only).
    async fn list_files(&self, path: &str) -> Result<Vec<String>, SandboxError>;

    /// Runs a shell command with the sandbox root as working directory.
    async fn run_command(
        &self,
        command: &str,
        options: RunOptions,
    ) -> Result<CommandResult, SandboxError>;

    /// Starts the framework dev server in `project_dir`, or returns the
    /// already-running one. The session's port is allocated on first call
    /// and never changes, so the preview URL stays stable across turns.
    async fn start_dev_server(
        &self,
        project_dir: &str,
        port: Option<u16>,
    ) -> Result<DevServer, SandboxError>;

    /// Preview URL for `port`, or for the session's allocated port.
    async fn get_preview_url(&self, port: Option<u16>) -> Result<String, SandboxError>;

    /// Refreshes the sandbox lifetime where the backend supports it.
    /// Returns false if the session is not initialized.
    async fn keep_alive(&self, timeout_secs: u64) -> Result<bool, SandboxError>;

    /// Tears the session down: kills the dev server and tracked background
    /// processes, optionally deletes the root directory, and resets the
    /// session to uninitialized. Idempotent.
    async fn destroy(&self, delete_files: bool) -> Result<(), SandboxError>;
}

/// Which backend a session runs on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SandboxMode {
    /// Host filesystem and OS processes.
    #[default]
    Local,
    /// External VM-sandbox provider.
    Remote,
}

impl std::fmt::Display for SandboxMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

impl std::str::FromStr for SandboxMode {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "remote" | "e2b" => Ok(Self::Remote),
            other => Err(SandboxError::initialization(format!(
                "unknown sandbox mode: '{other}'. Supported: local, remote"
            ))),
        }
    }
}

/// Creates the sandbox backend selected by the configuration.
///
/// The choice is made once here; call sites hold an `Arc<dyn Sandbox>` and
/// never branch on the mode again.
pub fn create_sandbox(
    config: &Config,
    session_id: impl Into<String>,
) -> Result<Arc<dyn Sandbox>, SandboxError> {
    let session_id = session_id.into();
    let mode: SandboxMode = config.sandbox.mode.parse()?;

    tracing::info!(session_id, %mode, "creating sandbox");

    match mode {
        SandboxMode::Local => Ok(Arc::new(LocalSandbox::new(
            config.sandbox.local.clone(),
            session_id,
        ))),
        SandboxMode::Remote => Ok(Arc::new(RemoteSandbox::new(
            config.sandbox.remote.clone(),
            session_id,
        ))),
    }
}
