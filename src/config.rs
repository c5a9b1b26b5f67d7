//! Configuration loading for appbox.
//!
//! Settings live in `appbox.toml` in the working directory; every field has
//! a default so the file is optional. The sandbox mode can additionally be
//! overridden with the `SANDBOX_MODE` environment variable, which wins over
//! the file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "appbox.toml";

/// Environment variable that overrides `[sandbox].mode`.
pub const SANDBOX_MODE_ENV: &str = "SANDBOX_MODE";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Sandbox backend selection and tuning.
    #[serde(default)]
    pub sandbox: SandboxConfig,
}

/// Sandbox configuration: backend mode plus per-backend sections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Backend to use: "local" or "remote" (alias "e2b").
    #[serde(default = "default_mode")]
    pub mode: String,

    /// Local backend configuration.
    #[serde(default)]
    pub local: LocalConfig,

    /// Remote provider configuration.
    #[serde(default)]
    pub remote: RemoteConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            local: LocalConfig::default(),
            remote: RemoteConfig::default(),
        }
    }
}

fn default_mode() -> String {
    "local".to_string()
}

/// Local filesystem backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Directory session roots are created under. Supports a leading `~`.
    /// Defaults to `<system tmpdir>/appbox`.
    #[serde(default)]
    pub base_dir: Option<String>,

    /// First port probed when allocating a dev-server port. Port 3000 is
    /// left for the host frontend.
    #[serde(default = "default_start_port")]
    pub start_port: u16,

    /// Command launched by `start_dev_server`; receives the port in the
    /// `PORT` environment variable.
    #[serde(default = "default_dev_command")]
    pub dev_command: String,

    /// Seconds to wait before probing whether the dev server survived.
    #[serde(default = "default_settle_secs")]
    pub settle_secs: u64,

    /// Seconds given to a background command to begin before returning.
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            base_dir: None,
            start_port: default_start_port(),
            dev_command: default_dev_command(),
            settle_secs: default_settle_secs(),
            grace_secs: default_grace_secs(),
        }
    }
}

impl LocalConfig {
    /// The directory session roots live under, with `~` expanded.
    pub fn resolved_base_dir(&self) -> PathBuf {
        match &self.base_dir {
            Some(dir) => expand_home(dir),
            None => std::env::temp_dir().join("appbox"),
        }
    }
}

/// Remote VM-sandbox provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Base URL of the provider API.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Environment variable holding the provider API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Template the provider boots sandboxes from.
    #[serde(default = "default_template")]
    pub template: String,

    /// Sandbox lifetime requested at creation, in minutes.
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,

    /// Domain preview hosts are served under
    /// (`https://{port}-{sandbox_id}.{domain}`).
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Port the dev server binds inside the remote sandbox. No local
    /// frontend conflict exists there, so the framework default is fine.
    #[serde(default = "default_remote_dev_port")]
    pub dev_port: u16,

    /// Dev server command, as for the local backend.
    #[serde(default = "default_dev_command")]
    pub dev_command: String,

    /// Seconds to wait before probing whether the dev server survived.
    #[serde(default = "default_settle_secs")]
    pub settle_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_key_env: default_api_key_env(),
            template: default_template(),
            timeout_minutes: default_timeout_minutes(),
            domain: default_domain(),
            dev_port: default_remote_dev_port(),
            dev_command: default_dev_command(),
            settle_secs: default_settle_secs(),
        }
    }
}

// Default value functions

fn default_start_port() -> u16 {
    crate::sandbox::DEFAULT_START_PORT
}

fn default_dev_command() -> String {
    "npm run dev".to_string()
}

fn default_settle_secs() -> u64 {
    5
}

fn default_grace_secs() -> u64 {
    2
}

fn default_api_url() -> String {
    "https://api.e2b.dev".to_string()
}

fn default_api_key_env() -> String {
    "E2B_API_KEY".to_string()
}

fn default_template() -> String {
    "base".to_string()
}

fn default_timeout_minutes() -> u64 {
    15
}

fn default_domain() -> String {
    "e2b.app".to_string()
}

fn default_remote_dev_port() -> u16 {
    3000
}

/// Expand ~ to home directory
fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

impl Config {
    /// Load configuration from `appbox.toml` in `dir`, using defaults if
    /// the file does not exist. `SANDBOX_MODE` overrides the file's mode.
    pub fn load(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);

        let mut config = if config_path.exists() {
            let content = fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?
        } else {
            Self::default()
        };

        if let Ok(mode) = std::env::var(SANDBOX_MODE_ENV) {
            if !mode.is_empty() {
                config.sandbox.mode = mode;
            }
        }

        Ok(config)
    }
}
