//! Sandboxed execution environments for LLM-driven app builders.
//!
//! appbox provisions one isolated workspace per session and gives callers a
//! uniform handle for file access, command execution, and dev-server
//! management inside it. Sandboxes are created lazily on first use, keep a
//! stable preview URL for the session's lifetime, and tear down cleanly.
//!
//! Two backends share the [`sandbox::Sandbox`] contract: a local backend
//! rooted in a host directory and a remote backend delegating to a
//! VM-sandbox provider. [`sandbox::create_sandbox`] picks one from the
//! configuration; [`registry::SessionRegistry`] maps session ids to live
//! handles.

pub mod config;
pub mod registry;
pub mod sandbox;

pub use config::Config;
pub use registry::SessionRegistry;
pub use sandbox::{
    create_sandbox, CommandResult, DevServer, RunOptions, Sandbox, SandboxError, SandboxMode,
    WriteReceipt,
};
