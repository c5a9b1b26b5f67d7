//! Remote VM-sandbox backend.
//!
//! Delegates every operation to an external sandbox provider over its HTTP
//! API: sandbox creation, file transfer, command execution, and lifetime
//! refresh all happen inside the provider's VM. This backend owns no
//! filesystem or processes of its own; path containment is enforced by the
//! provider. Preview URLs use the provider's per-port host mapping:
//! `https://{port}-{sandbox_id}.{domain}`.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::config::RemoteConfig;

use super::error::truncate_for_display;
use super::{CommandResult, DevServer, RunOptions, Sandbox, SandboxError, WriteReceipt};

/// Where the dev server's output is captured inside the remote sandbox.
const REMOTE_DEV_LOG: &str = "/tmp/appbox-dev-server.log";

/// A failed provider API call.
#[derive(Debug)]
struct ProviderError {
    status: Option<u16>,
    message: String,
}

impl ProviderError {
    fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    fn is_not_found(&self) -> bool {
        self.status == Some(404)
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "provider returned {status}: {}", self.message),
            None => write!(f, "provider request failed: {}", self.message),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreateSandboxResponse {
    #[serde(rename = "sandboxID")]
    sandbox_id: String,
}

#[derive(Debug, Deserialize)]
struct ReadFileResponse {
    content: String,
}

#[derive(Debug, Deserialize)]
struct RunCommandResponse {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    exit_code: i32,
    #[serde(default)]
    pid: Option<u32>,
}

/// Thin client for the provider's sandbox API.
#[derive(Clone)]
struct ProviderClient {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
}

impl ProviderClient {
    fn new(config: &RemoteConfig) -> Result<Self, SandboxError> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            SandboxError::initialization(format!(
                "provider API key not configured: set {}",
                config.api_key_env
            ))
        })?;
        Ok(Self {
            http: reqwest::Client::new(),
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ProviderError {
            status: Some(status.as_u16()),
            message: truncate_for_display(&body),
        })
    }

    async fn post(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .http
            .post(format!("{}{path}", self.api_url))
            .header("X-API-Key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::transport(e.to_string()))?;
        Self::check(response).await
    }

    async fn create_sandbox(
        &self,
        template: &str,
        timeout_secs: u64,
    ) -> Result<String, ProviderError> {
        let response = self
            .post(
                "/sandboxes",
                json!({ "templateID": template, "timeout": timeout_secs }),
            )
            .await?;
        let created: CreateSandboxResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::transport(e.to_string()))?;
        Ok(created.sandbox_id)
    }

    async fn write_file(
        &self,
        sandbox_id: &str,
        path: &str,
        content: &str,
    ) -> Result<(), ProviderError> {
        self.post(
            &format!("/sandboxes/{sandbox_id}/files"),
            json!({ "path": path, "content": content }),
        )
        .await?;
        Ok(())
    }

    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<String, ProviderError> {
        let response = self
            .http
            .get(format!("{}/sandboxes/{sandbox_id}/files", self.api_url))
            .header("X-API-Key", &self.api_key)
            .query(&[("path", path)])
            .send()
            .await
            .map_err(|e| ProviderError::transport(e.to_string()))?;
        let response = Self::check(response).await?;
        let file: ReadFileResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::transport(e.to_string()))?;
        Ok(file.content)
    }

    async fn run_command(
        &self,
        sandbox_id: &str,
        command: &str,
        background: bool,
        timeout_secs: Option<u64>,
    ) -> Result<RunCommandResponse, ProviderError> {
        let response = self
            .post(
                &format!("/sandboxes/{sandbox_id}/commands"),
                command_body(command, background, timeout_secs),
            )
            .await?;
        response
            .json()
            .await
            .map_err(|e| ProviderError::transport(e.to_string()))
    }

    async fn set_timeout(&self, sandbox_id: &str, timeout_secs: u64) -> Result<(), ProviderError> {
        self.post(
            &format!("/sandboxes/{sandbox_id}/timeout"),
            json!({ "timeout": timeout_secs }),
        )
        .await?;
        Ok(())
    }

    async fn kill_sandbox(&self, sandbox_id: &str) -> Result<(), ProviderError> {
        let response = self
            .http
            .delete(format!("{}/sandboxes/{sandbox_id}", self.api_url))
            .header("X-API-Key", &self.api_key)
            .send()
            .await
            .map_err(|e| ProviderError::transport(e.to_string()))?;
        Self::check(response).await?;
        Ok(())
    }
}

/// Request body for the provider's command endpoint. The timeout is sent
/// along so the provider kills an overrunning process inside the VM.
fn command_body(command: &str, background: bool, timeout_secs: Option<u64>) -> serde_json::Value {
    let mut body = json!({ "command": command, "background": background });
    if let Some(secs) = timeout_secs {
        body["timeout_secs"] = json!(secs);
    }
    body
}

#[derive(Debug)]
enum RemoteState {
    Uninitialized,
    Ready { sandbox_id: String },
    Destroyed,
}

/// Provider-backed sandbox for one session.
///
/// Creation is lazy: the remote sandbox is booted on the first operation.
/// The provider enforces its own lifetime; `keep_alive` extends it.
pub struct RemoteSandbox {
    config: RemoteConfig,
    session_id: String,
    state: Mutex<RemoteState>,
    client: Mutex<Option<ProviderClient>>,
    initialized: AtomicBool,
    /// Sync mirror of the provider sandbox id for the accessor.
    sandbox_ref: StdMutex<Option<String>>,
    /// Port the dev server was started on; 0 means none yet.
    allocated_port: AtomicU16,
    /// Pid of the dev server inside the remote sandbox; 0 means none.
    dev_server: Mutex<Option<u32>>,
}

impl RemoteSandbox {
    /// Creates an uninitialized session. No provider calls are made.
    pub fn new(config: RemoteConfig, session_id: impl Into<String>) -> Self {
        let session_id = session_id.into();
        debug!(session = %session_id, "remote sandbox constructed");
        Self {
            config,
            session_id,
            state: Mutex::new(RemoteState::Uninitialized),
            client: Mutex::new(None),
            initialized: AtomicBool::new(false),
            sandbox_ref: StdMutex::new(None),
            allocated_port: AtomicU16::new(0),
            dev_server: Mutex::new(None),
        }
    }

    fn preview_host(&self, port: u16, sandbox_id: &str) -> String {
        format!("https://{port}-{sandbox_id}.{}", self.config.domain)
    }

    /// Idempotent provisioning: boots the remote sandbox exactly once.
    /// Returns a client handle plus the sandbox id; the state lock is not
    /// held by subsequent operations.
    async fn ensure_created(&self) -> Result<(ProviderClient, String), SandboxError> {
        let mut state = self.state.lock().await;

        if let RemoteState::Ready { sandbox_id } = &*state {
            debug!(session = %self.session_id, "sandbox already initialized");
            let client = self.client_handle().await?;
            return Ok((client, sandbox_id.clone()));
        }

        let client = self.client_handle().await?;
        info!(
            session = %self.session_id,
            template = %self.config.template,
            "creating remote sandbox"
        );

        let sandbox_id = client
            .create_sandbox(&self.config.template, self.config.timeout_minutes * 60)
            .await
            .map_err(|e| {
                SandboxError::initialization(format!(
                    "failed to create sandbox from template '{}': {e}",
                    self.config.template
                ))
            })?;

        info!(session = %self.session_id, sandbox_id, "remote sandbox created");

        if let Ok(mut sandbox_ref) = self.sandbox_ref.lock() {
            *sandbox_ref = Some(sandbox_id.clone());
        }
        self.initialized.store(true, Ordering::SeqCst);
        *state = RemoteState::Ready {
            sandbox_id: sandbox_id.clone(),
        };

        Ok((client, sandbox_id))
    }

    /// Builds the provider client on first use so a missing API key only
    /// fails once a remote call is actually attempted.
    async fn client_handle(&self) -> Result<ProviderClient, SandboxError> {
        let mut client = self.client.lock().await;
        if let Some(existing) = client.as_ref() {
            return Ok(existing.clone());
        }
        let fresh = ProviderClient::new(&self.config)?;
        *client = Some(fresh.clone());
        Ok(fresh)
    }

    /// Probes whether a pid inside the remote sandbox is still alive.
    async fn process_alive(
        client: &ProviderClient,
        sandbox_id: &str,
        pid: u32,
    ) -> Result<bool, ProviderError> {
        let probe = client
            .run_command(sandbox_id, &format!("kill -0 {pid}"), false, None)
            .await?;
        Ok(probe.exit_code == 0)
    }
}

#[async_trait]
impl Sandbox for RemoteSandbox {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn sandbox_id(&self) -> Option<String> {
        self.sandbox_ref.lock().ok().and_then(|id| id.clone())
    }

    fn preview_url(&self) -> Option<String> {
        let port = self.allocated_port.load(Ordering::SeqCst);
        if port == 0 {
            return None;
        }
        let sandbox_id = self.sandbox_id()?;
        Some(self.preview_host(port, &sandbox_id))
    }

    async fn ensure(&self) -> Result<(), SandboxError> {
        self.ensure_created().await.map(|_| ())
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<WriteReceipt, SandboxError> {
        let (client, sandbox_id) = self.ensure_created().await?;
        debug!(session = %self.session_id, path, "writing file");

        client
            .write_file(&sandbox_id, path, content)
            .await
            .map_err(|e| SandboxError::file_operation(path, e.to_string()))?;

        let size = content.len();
        info!(session = %self.session_id, path, size, "file written");
        Ok(WriteReceipt {
            path: path.to_string(),
            size,
        })
    }

    async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        let (client, sandbox_id) = self.ensure_created().await?;
        debug!(session = %self.session_id, path, "reading file");

        match client.read_file(&sandbox_id, path).await {
            Ok(content) => {
                info!(session = %self.session_id, path, size = content.len(), "file read");
                Ok(content)
            }
            Err(e) if e.is_not_found() => Err(SandboxError::file_not_found(path)),
            Err(e) => Err(SandboxError::file_operation(path, e.to_string())),
        }
    }

    async fn list_files(&self, path: &str) -> Result<Vec<String>, SandboxError> {
        let (client, sandbox_id) = self.ensure_created().await?;
        debug!(session = %self.session_id, path, "listing files");

        let listing = client
            .run_command(&sandbox_id, &format!("ls -1 {path}"), false, None)
            .await
            .map_err(|e| SandboxError::file_operation(path, e.to_string()))?;

        if listing.exit_code != 0 {
            return Err(SandboxError::file_operation(
                path,
                truncate_for_display(&listing.stderr),
            ));
        }

        let names: Vec<String> = listing
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToString::to_string)
            .collect();

        info!(session = %self.session_id, count = names.len(), "listed directory");
        Ok(names)
    }

    async fn run_command(
        &self,
        command: &str,
        options: RunOptions,
    ) -> Result<CommandResult, SandboxError> {
        let (client, sandbox_id) = self.ensure_created().await?;
        info!(
            session = %self.session_id,
            command = %truncate_for_display(command),
            background = options.background,
            "executing command"
        );

        if options.background {
            let spawned = client
                .run_command(&sandbox_id, command, true, None)
                .await
                .map_err(|e| SandboxError::command_spawn(command, e.to_string()))?;

            info!(session = %self.session_id, pid = ?spawned.pid, "background process started");
            return Ok(CommandResult {
                stdout: "Process started in background".to_string(),
                stderr: String::new(),
                exit_code: 0,
                success: true,
                background: true,
                pid: spawned.pid,
            });
        }

        // The timeout also rides along in the request so the provider
        // enforces it inside the VM. The client-side timer below only
        // covers a hung connection; on that path the remote process is
        // reclaimed by the provider, not killed from here.
        let run = client.run_command(&sandbox_id, command, false, options.effective_timeout());
        let response = match options.effective_timeout() {
            Some(secs) => match timeout(Duration::from_secs(secs), run).await {
                Ok(result) => {
                    result.map_err(|e| SandboxError::command_spawn(command, e.to_string()))?
                }
                Err(_) => {
                    error!(
                        session = %self.session_id,
                        command = %truncate_for_display(command),
                        timeout_secs = secs,
                        "command timed out"
                    );
                    return Err(SandboxError::command_timeout(command, secs));
                }
            },
            None => run
                .await
                .map_err(|e| SandboxError::command_spawn(command, e.to_string()))?,
        };

        let success = response.exit_code == 0;
        if success {
            info!(
                session = %self.session_id,
                command = %truncate_for_display(command),
                exit_code = response.exit_code,
                "command completed"
            );
        } else {
            warn!(
                session = %self.session_id,
                command = %truncate_for_display(command),
                exit_code = response.exit_code,
                stderr = %truncate_for_display(&response.stderr),
                "command failed"
            );
        }

        Ok(CommandResult {
            stdout: response.stdout,
            stderr: response.stderr,
            exit_code: response.exit_code,
            success,
            background: false,
            pid: None,
        })
    }

    async fn start_dev_server(
        &self,
        project_dir: &str,
        port: Option<u16>,
    ) -> Result<DevServer, SandboxError> {
        let (client, sandbox_id) = self.ensure_created().await?;
        let mut dev_server = self.dev_server.lock().await;

        let server_port = match port {
            Some(p) => p,
            None => {
                let allocated = self.allocated_port.load(Ordering::SeqCst);
                if allocated != 0 {
                    allocated
                } else {
                    self.config.dev_port
                }
            }
        };
        self.allocated_port.store(server_port, Ordering::SeqCst);

        if let Some(pid) = *dev_server {
            match Self::process_alive(&client, &sandbox_id, pid).await {
                Ok(true) => {
                    info!(
                        session = %self.session_id,
                        port = server_port,
                        pid,
                        "dev server already running, returning existing preview URL"
                    );
                    return Ok(DevServer {
                        preview_url: self.preview_host(server_port, &sandbox_id),
                        port: server_port,
                        pid,
                        reused: true,
                    });
                }
                Ok(false) => {
                    debug!(session = %self.session_id, "previous dev server exited, starting a new one");
                    *dev_server = None;
                }
                Err(e) => {
                    warn!(session = %self.session_id, "failed to probe dev server: {e}");
                    *dev_server = None;
                }
            }
        }

        let mut command = String::new();
        if project_dir != "." {
            command.push_str(&format!("cd {project_dir} && "));
        }
        command.push_str(&format!(
            "PORT={server_port} {} > {REMOTE_DEV_LOG} 2>&1",
            self.config.dev_command
        ));

        info!(
            session = %self.session_id,
            port = server_port,
            command = %self.config.dev_command,
            "starting dev server"
        );

        let spawned = client
            .run_command(&sandbox_id, &command, true, None)
            .await
            .map_err(|e| SandboxError::command_spawn(&self.config.dev_command, e.to_string()))?;
        let Some(pid) = spawned.pid else {
            return Err(SandboxError::dev_server_start(
                "provider did not report a pid for the dev server",
                String::new(),
            ));
        };

        debug!(session = %self.session_id, "waiting for dev server to start");
        sleep(Duration::from_secs(self.config.settle_secs)).await;

        match Self::process_alive(&client, &sandbox_id, pid).await {
            Ok(true) => {}
            Ok(false) => {
                let output = client
                    .run_command(
                        &sandbox_id,
                        &format!("tail -c 2000 {REMOTE_DEV_LOG}"),
                        false,
                        None,
                    )
                    .await
                    .map(|r| r.stdout)
                    .unwrap_or_else(|e| format!("<failed to read dev server log: {e}>"));
                error!(
                    session = %self.session_id,
                    output = %truncate_for_display(&output),
                    "dev server exited during settle window"
                );
                return Err(SandboxError::dev_server_start(
                    format!(
                        "dev server exited within {}s of starting",
                        self.config.settle_secs
                    ),
                    output,
                ));
            }
            Err(e) => {
                return Err(SandboxError::dev_server_start(
                    format!("failed to probe dev server after start: {e}"),
                    String::new(),
                ));
            }
        }

        *dev_server = Some(pid);
        let preview_url = self.preview_host(server_port, &sandbox_id);
        info!(session = %self.session_id, %preview_url, pid, "dev server started");
        Ok(DevServer {
            preview_url,
            port: server_port,
            pid,
            reused: false,
        })
    }

    async fn get_preview_url(&self, port: Option<u16>) -> Result<String, SandboxError> {
        let (_, sandbox_id) = self.ensure_created().await?;

        let port = port.unwrap_or_else(|| {
            let allocated = self.allocated_port.load(Ordering::SeqCst);
            if allocated != 0 {
                allocated
            } else {
                self.config.dev_port
            }
        });

        let url = self.preview_host(port, &sandbox_id);
        info!(session = %self.session_id, port, %url, "generated preview URL");
        Ok(url)
    }

    async fn keep_alive(&self, timeout_secs: u64) -> Result<bool, SandboxError> {
        if !self.is_initialized() {
            return Ok(false);
        }
        let (client, sandbox_id) = self.ensure_created().await?;

        client
            .set_timeout(&sandbox_id, timeout_secs)
            .await
            .map_err(|e| {
                SandboxError::initialization(format!("failed to refresh sandbox lifetime: {e}"))
            })?;

        debug!(session = %self.session_id, timeout_secs, "sandbox lifetime refreshed");
        Ok(true)
    }

    async fn destroy(&self, _delete_files: bool) -> Result<(), SandboxError> {
        let mut state = self.state.lock().await;

        let sandbox_id = match &*state {
            RemoteState::Ready { sandbox_id } => sandbox_id.clone(),
            RemoteState::Uninitialized | RemoteState::Destroyed => {
                debug!(session = %self.session_id, "sandbox not initialized, nothing to destroy");
                return Ok(());
            }
        };

        info!(session = %self.session_id, sandbox_id, "destroying remote sandbox");

        // Best-effort: a failed kill is logged, not propagated, so session
        // teardown always completes. The provider's own timeout reclaims
        // the VM eventually.
        match self.client_handle().await {
            Ok(client) => {
                if let Err(e) = client.kill_sandbox(&sandbox_id).await {
                    warn!(session = %self.session_id, "failed to kill remote sandbox: {e}");
                }
            }
            Err(e) => {
                warn!(session = %self.session_id, "no provider client for teardown: {e}");
            }
        }

        *self.dev_server.lock().await = None;
        if let Ok(mut sandbox_ref) = self.sandbox_ref.lock() {
            *sandbox_ref = None;
        }
        self.allocated_port.store(0, Ordering::SeqCst);
        self.initialized.store(false, Ordering::SeqCst);
        *state = RemoteState::Destroyed;

        info!(session = %self.session_id, "remote sandbox destroyed");
        Ok(())
    }
}
