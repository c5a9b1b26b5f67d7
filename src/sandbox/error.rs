//! Domain-specific error types for sandbox operations.
//!
//! Typed errors enable callers to match on specific failure modes
//! rather than parsing error message strings. Raw OS errors are always
//! wrapped at the operation boundary; callers never see `std::io::Error`
//! directly.

/// Maximum length of a command or path echoed back in an error message.
const DISPLAY_LIMIT: usize = 80;

/// Errors that can occur during sandbox operations.
///
/// A non-zero exit code from a foreground command is *not* an error in
/// this taxonomy; it is normal [`CommandResult`](super::CommandResult)
/// data the caller inspects.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Provisioning the sandbox root or remote sandbox failed.
    #[error("Sandbox initialization failed: {message}")]
    Initialization { message: String },

    /// A `..`-laden path would resolve outside the sandbox root.
    #[error("Path escapes the sandbox root: {path}")]
    PathTraversal { path: String },

    /// The requested file does not exist.
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    /// A read/write/list operation failed for any reason other than
    /// traversal or not-found.
    #[error("File operation failed for '{path}': {message}")]
    FileOperation { path: String, message: String },

    /// A foreground command exceeded its timeout. The process is killed
    /// before this error is returned.
    #[error("Command timed out after {timeout_secs}s: {command}")]
    CommandTimeout { command: String, timeout_secs: u64 },

    /// The process could not be spawned at all.
    #[error("Failed to spawn command '{command}': {message}")]
    CommandSpawn { command: String, message: String },

    /// No bindable port was found in the search window.
    #[error("No available port in range {start}-{end}")]
    PortExhausted { start: u16, end: u16 },

    /// The dev server process exited before the settle window elapsed.
    /// Carries a tail of its captured output for diagnostics.
    #[error("Dev server failed to start: {message}")]
    DevServerStart { message: String, output: String },
}

impl SandboxError {
    /// Creates an `Initialization` error.
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization {
            message: message.into(),
        }
    }

    /// Creates a `PathTraversal` error, truncating the offending path.
    pub fn path_traversal(path: impl AsRef<str>) -> Self {
        Self::PathTraversal {
            path: truncate_for_display(path.as_ref()),
        }
    }

    /// Creates a `FileNotFound` error.
    pub fn file_not_found(path: impl AsRef<str>) -> Self {
        Self::FileNotFound {
            path: truncate_for_display(path.as_ref()),
        }
    }

    /// Creates a `FileOperation` error naming the caller-supplied path.
    pub fn file_operation(path: impl AsRef<str>, message: impl Into<String>) -> Self {
        Self::FileOperation {
            path: truncate_for_display(path.as_ref()),
            message: message.into(),
        }
    }

    /// Creates a `CommandTimeout` error, truncating the command.
    pub fn command_timeout(command: impl AsRef<str>, timeout_secs: u64) -> Self {
        Self::CommandTimeout {
            command: truncate_for_display(command.as_ref()),
            timeout_secs,
        }
    }

    /// Creates a `CommandSpawn` error, truncating the command.
    pub fn command_spawn(command: impl AsRef<str>, message: impl Into<String>) -> Self {
        Self::CommandSpawn {
            command: truncate_for_display(command.as_ref()),
            message: message.into(),
        }
    }

    /// Creates a `PortExhausted` error for a probe window.
    pub fn port_exhausted(start: u16, attempts: u16) -> Self {
        Self::PortExhausted {
            start,
            end: start.saturating_add(attempts),
        }
    }

    /// Creates a `DevServerStart` error carrying captured output.
    pub fn dev_server_start(message: impl Into<String>, output: impl Into<String>) -> Self {
        Self::DevServerStart {
            message: message.into(),
            output: output.into(),
        }
    }

    /// Returns true if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::CommandTimeout { .. })
    }

    /// Returns true if this is a traversal rejection.
    pub fn is_traversal(&self) -> bool {
        matches!(self, Self::PathTraversal { .. })
    }

    /// Returns true if the target file did not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::FileNotFound { .. })
    }

    /// Returns true if this is an initialization failure. Operations on
    /// the session must not be retried without re-ensuring it.
    pub fn is_initialization(&self) -> bool {
        matches!(self, Self::Initialization { .. })
    }
}

/// Truncates a command or path for inclusion in error messages.
pub(crate) fn truncate_for_display(text: &str) -> String {
    if text.chars().count() <= DISPLAY_LIMIT {
        text.to_string()
    } else {
        let head: String = text.chars().take(DISPLAY_LIMIT).collect();
        format!("{head}...")
    }
}
