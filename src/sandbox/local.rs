//! Local filesystem sandbox backend.
//!
//! Confines a session to `<base_dir>/<session_id>` and runs commands as
//! ordinary OS processes with that directory as working directory. Used for
//! development and testing; the remote backend provides real VM isolation.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::config::LocalConfig;

use super::error::truncate_for_display;
use super::path::resolve_path;
use super::port::find_available_port;
use super::process::ProcessHandle;
use super::{CommandResult, DevServer, RunOptions, Sandbox, SandboxError, WriteReceipt};

/// Name of the directory under the sandbox root holding manager artifacts
/// such as the dev-server log.
const INTERNAL_DIR: &str = ".appbox";

/// How many bytes of dev-server output to return when startup fails.
const OUTPUT_TAIL_BYTES: usize = 2000;

/// Session lifecycle. The `Initializing` phase of the state machine is the
/// span where the mutex is held during provisioning; it is never observable
/// from outside.
#[derive(Debug)]
enum SessionState {
    Uninitialized,
    Ready(PathBuf),
    Destroyed,
}

/// Filesystem-backed sandbox for one session.
///
/// Provisioning is lazy: the root directory is created and a dev-server
/// port allocated on the first operation, not at construction. `destroy`
/// resets the session; a later `ensure` provisions a fresh root.
pub struct LocalSandbox {
    config: LocalConfig,
    session_id: String,
    state: Mutex<SessionState>,
    /// Mirrors `state` for the sync accessor.
    initialized: AtomicBool,
    /// Allocated dev-server port; 0 means none.
    allocated_port: AtomicU16,
    dev_server: Mutex<Option<ProcessHandle>>,
    background: Mutex<Vec<ProcessHandle>>,
}

impl LocalSandbox {
    /// Creates an uninitialized session. No filesystem side effects.
    pub fn new(config: LocalConfig, session_id: impl Into<String>) -> Self {
        let session_id = session_id.into();
        debug!(session = %session_id, "local sandbox constructed");
        Self {
            config,
            session_id,
            state: Mutex::new(SessionState::Uninitialized),
            initialized: AtomicBool::new(false),
            allocated_port: AtomicU16::new(0),
            dev_server: Mutex::new(None),
            background: Mutex::new(Vec::new()),
        }
    }

    /// Idempotent provisioning: returns the existing root, or creates the
    /// directory and allocates the session port. The state mutex is held
    /// across the whole check-and-create sequence so concurrent callers
    /// cannot race to create two roots; it is not held by file or command
    /// operations afterwards.
    async fn ensure_root(&self) -> Result<PathBuf, SandboxError> {
        let mut state = self.state.lock().await;

        if let SessionState::Ready(root) = &*state {
            debug!(session = %self.session_id, "sandbox already initialized");
            return Ok(root.clone());
        }

        let base_dir = self.config.resolved_base_dir();
        let root = base_dir.join(&self.session_id);
        tokio::fs::create_dir_all(&root).await.map_err(|e| {
            SandboxError::initialization(format!(
                "failed to create sandbox directory '{}': {e}",
                root.display()
            ))
        })?;

        // Canonicalize so containment checks hold even when the base dir
        // sits behind a symlink (macOS /tmp -> /private/tmp).
        let root = tokio::fs::canonicalize(&root).await.map_err(|e| {
            SandboxError::initialization(format!(
                "failed to canonicalize sandbox directory '{}': {e}",
                root.display()
            ))
        })?;

        let port = find_available_port(self.config.start_port).await?;
        self.allocated_port.store(port, Ordering::SeqCst);

        *state = SessionState::Ready(root.clone());
        self.initialized.store(true, Ordering::SeqCst);

        info!(
            session = %self.session_id,
            root = %root.display(),
            port,
            "local sandbox created"
        );
        Ok(root)
    }

    fn local_url(port: u16) -> String {
        format!("http://localhost:{port}")
    }

    /// Reads the tail of the dev-server log for failure diagnostics.
    async fn read_log_tail(log_path: &std::path::Path) -> String {
        match tokio::fs::read_to_string(log_path).await {
            Ok(content) => {
                let mut start = content.len().saturating_sub(OUTPUT_TAIL_BYTES);
                // Stay on a char boundary for the slice.
                while !content.is_char_boundary(start) {
                    start += 1;
                }
                content[start..].to_string()
            }
            Err(e) => format!("<failed to read dev server log: {e}>"),
        }
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn name(&self) -> &'static str {
        "local"
    }

    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn sandbox_id(&self) -> Option<String> {
        self.is_initialized().then(|| self.session_id.clone())
    }

    fn preview_url(&self) -> Option<String> {
        let port = self.allocated_port.load(Ordering::SeqCst);
        (port != 0).then(|| Self::local_url(port))
    }

    async fn ensure(&self) -> Result<(), SandboxError> {
        self.ensure_root().await.map(|_| ())
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<WriteReceipt, SandboxError> {
        let root = self.ensure_root().await?;
        let resolved = resolve_path(&root, path)?;
        debug!(session = %self.session_id, path = %resolved.display(), "writing file");

        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SandboxError::file_operation(path, e.to_string()))?;
        }

        tokio::fs::write(&resolved, content)
            .await
            .map_err(|e| SandboxError::file_operation(path, e.to_string()))?;

        let size = content.len();
        info!(
            session = %self.session_id,
            path = %resolved.display(),
            size,
            "file written"
        );
        Ok(WriteReceipt {
            path: resolved.display().to_string(),
            size,
        })
    }

    async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        let root = self.ensure_root().await?;
        let resolved = resolve_path(&root, path)?;
        debug!(session = %self.session_id, path = %resolved.display(), "reading file");

        match tokio::fs::read_to_string(&resolved).await {
            Ok(content) => {
                info!(
                    session = %self.session_id,
                    path = %resolved.display(),
                    size = content.len(),
                    "file read"
                );
                Ok(content)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SandboxError::file_not_found(path))
            }
            Err(e) => Err(SandboxError::file_operation(path, e.to_string())),
        }
    }

    async fn list_files(&self, path: &str) -> Result<Vec<String>, SandboxError> {
        let root = self.ensure_root().await?;
        let resolved = resolve_path(&root, path)?;
        debug!(session = %self.session_id, path = %resolved.display(), "listing files");

        let metadata = match tokio::fs::metadata(&resolved).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SandboxError::file_operation(path, "directory not found"));
            }
            Err(e) => return Err(SandboxError::file_operation(path, e.to_string())),
        };
        if !metadata.is_dir() {
            return Err(SandboxError::file_operation(path, "not a directory"));
        }

        let mut entries = tokio::fs::read_dir(&resolved)
            .await
            .map_err(|e| SandboxError::file_operation(path, e.to_string()))?;

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SandboxError::file_operation(path, e.to_string()))?
        {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }

        info!(
            session = %self.session_id,
            count = names.len(),
            "listed directory"
        );
        Ok(names)
    }

    async fn run_command(
        &self,
        command: &str,
        options: RunOptions,
    ) -> Result<CommandResult, SandboxError> {
        let root = self.ensure_root().await?;
        info!(
            session = %self.session_id,
            command = %truncate_for_display(command),
            background = options.background,
            "executing command"
        );

        if options.background {
            let child = Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(&root)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .map_err(|e| SandboxError::command_spawn(command, e.to_string()))?;

            let handle = ProcessHandle::new(child);
            let pid = handle.pid();
            self.background.lock().await.push(handle);

            // Give the process time to begin before reporting back.
            sleep(Duration::from_secs(self.config.grace_secs)).await;

            info!(session = %self.session_id, pid, "background process started");
            return Ok(CommandResult {
                stdout: "Process started in background".to_string(),
                stderr: String::new(),
                exit_code: 0,
                success: true,
                background: true,
                pid: Some(pid),
            });
        }

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Backstop: if this future itself is dropped mid-wait, the
            // process is killed rather than orphaned.
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::command_spawn(command, e.to_string()))?;

        // Drain the pipes alongside the wait so a chatty command cannot
        // fill the pipe buffer and wedge against it.
        let stdout_task = tokio::spawn(drain_pipe(child.stdout.take()));
        let stderr_task = tokio::spawn(drain_pipe(child.stderr.take()));

        let status = match options.effective_timeout() {
            Some(secs) => match timeout(Duration::from_secs(secs), child.wait()).await {
                Ok(result) => {
                    result.map_err(|e| SandboxError::command_spawn(command, e.to_string()))?
                }
                Err(_) => {
                    // Kill and reap before returning; the error must not
                    // race a still-exiting process.
                    if let Err(e) = child.kill().await {
                        warn!(session = %self.session_id, "failed to kill timed-out process: {e}");
                    }
                    error!(
                        session = %self.session_id,
                        command = %truncate_for_display(command),
                        timeout_secs = secs,
                        "command timed out, process killed"
                    );
                    return Err(SandboxError::command_timeout(command, secs));
                }
            },
            None => child
                .wait()
                .await
                .map_err(|e| SandboxError::command_spawn(command, e.to_string()))?,
        };

        let stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).into_owned();
        let stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).into_owned();
        let exit_code = status.code().unwrap_or(-1);
        let success = exit_code == 0;

        if success {
            info!(
                session = %self.session_id,
                command = %truncate_for_display(command),
                exit_code,
                "command completed"
            );
        } else {
            warn!(
                session = %self.session_id,
                command = %truncate_for_display(command),
                exit_code,
                stderr = %truncate_for_display(&stderr),
                "command failed"
            );
        }

        Ok(CommandResult {
            stdout,
            stderr,
            exit_code,
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
        let root = self.ensure_root().await?;

        // Holding the handle lock across the settle window serializes
        // concurrent start calls, so two servers can never race onto the
        // same port.
        let mut dev_server = self.dev_server.lock().await;

        if let Some(mut handle) = dev_server.take() {
            if handle.is_running() {
                // Report the port the live server is actually bound to; an
                // earlier explicit-port start may have moved it off the
                // session's originally allocated port.
                let bound_port = self.allocated_port.load(Ordering::SeqCst);
                info!(
                    session = %self.session_id,
                    port = bound_port,
                    pid = handle.pid(),
                    "dev server already running, returning existing preview URL"
                );
                let result = DevServer {
                    preview_url: Self::local_url(bound_port),
                    port: bound_port,
                    pid: handle.pid(),
                    reused: true,
                };
                *dev_server = Some(handle);
                return Ok(result);
            }
            debug!(session = %self.session_id, "previous dev server exited, starting a new one");
        }

        let server_port = match port {
            Some(p) => p,
            None => {
                let allocated = self.allocated_port.load(Ordering::SeqCst);
                if allocated != 0 {
                    allocated
                } else {
                    find_available_port(self.config.start_port).await?
                }
            }
        };

        let work_dir = resolve_path(&root, project_dir)?;

        let log_dir = root.join(INTERNAL_DIR);
        tokio::fs::create_dir_all(&log_dir)
            .await
            .map_err(|e| SandboxError::file_operation(project_dir, e.to_string()))?;
        let log_path = log_dir.join("dev-server.log");
        let log_out = std::fs::File::create(&log_path)
            .map_err(|e| SandboxError::file_operation(project_dir, e.to_string()))?;
        let log_err = log_out
            .try_clone()
            .map_err(|e| SandboxError::file_operation(project_dir, e.to_string()))?;

        info!(
            session = %self.session_id,
            dir = %work_dir.display(),
            port = server_port,
            command = %self.config.dev_command,
            "starting dev server"
        );

        let child = Command::new("sh")
            .arg("-c")
            .arg(&self.config.dev_command)
            .current_dir(&work_dir)
            .env("PORT", server_port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_out))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|e| SandboxError::command_spawn(&self.config.dev_command, e.to_string()))?;

        let mut handle = ProcessHandle::new(child);

        // Let the server come up, then make sure it is still alive. A
        // server that died immediately must never yield a preview URL.
        debug!(session = %self.session_id, "waiting for dev server to start");
        sleep(Duration::from_secs(self.config.settle_secs)).await;

        if !handle.is_running() {
            let output = Self::read_log_tail(&log_path).await;
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

        let pid = handle.pid();
        *dev_server = Some(handle);

        // The session's port follows the server that is actually running.
        self.allocated_port.store(server_port, Ordering::SeqCst);

        let preview_url = Self::local_url(server_port);
        info!(session = %self.session_id, %preview_url, pid, "dev server started");
        Ok(DevServer {
            preview_url,
            port: server_port,
            pid,
            reused: false,
        })
    }

    async fn get_preview_url(&self, port: Option<u16>) -> Result<String, SandboxError> {
        self.ensure_root().await?;

        let port = match port {
            Some(p) => p,
            None => {
                let allocated = self.allocated_port.load(Ordering::SeqCst);
                if allocated == 0 {
                    return Err(SandboxError::initialization(
                        "no port allocated; call start_dev_server first or provide a port",
                    ));
                }
                allocated
            }
        };

        Ok(Self::local_url(port))
    }

    async fn keep_alive(&self, _timeout_secs: u64) -> Result<bool, SandboxError> {
        // Local directories have no lifetime to refresh.
        debug!(session = %self.session_id, "keep_alive is a no-op for local sandboxes");
        Ok(self.is_initialized())
    }

    async fn destroy(&self, delete_files: bool) -> Result<(), SandboxError> {
        let mut state = self.state.lock().await;

        let root = match &*state {
            SessionState::Ready(root) => root.clone(),
            SessionState::Uninitialized | SessionState::Destroyed => {
                debug!(session = %self.session_id, "sandbox not initialized, nothing to destroy");
                return Ok(());
            }
        };

        info!(session = %self.session_id, "destroying local sandbox");

        if let Some(handle) = self.dev_server.lock().await.take() {
            info!(
                session = %self.session_id,
                pid = handle.pid(),
                "terminating dev server process"
            );
            handle.shutdown().await;
        }

        let background: Vec<ProcessHandle> = self.background.lock().await.drain(..).collect();
        for handle in background {
            debug!(
                session = %self.session_id,
                pid = handle.pid(),
                "terminating background process"
            );
            handle.shutdown().await;
        }

        if delete_files {
            info!(session = %self.session_id, root = %root.display(), "deleting project directory");
            if let Err(e) = tokio::fs::remove_dir_all(&root).await {
                warn!(session = %self.session_id, "failed to delete project directory: {e}");
            }
        } else {
            info!(session = %self.session_id, root = %root.display(), "keeping project directory");
        }

        self.allocated_port.store(0, Ordering::SeqCst);
        self.initialized.store(false, Ordering::SeqCst);
        *state = SessionState::Destroyed;

        info!(session = %self.session_id, "local sandbox destroyed");
        Ok(())
    }
}

/// Reads a child pipe to EOF, tolerating a missing handle.
async fn drain_pipe<R>(pipe: Option<R>) -> Vec<u8>
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;
    use tempfile::{tempdir, TempDir};

    fn config_in(dir: &TempDir) -> LocalConfig {
        LocalConfig {
            base_dir: Some(dir.path().to_string_lossy().into_owned()),
            settle_secs: 1,
            grace_secs: 0,
            ..LocalConfig::default()
        }
    }

    fn sandbox_in(dir: &TempDir) -> LocalSandbox {
        LocalSandbox::new(config_in(dir), "test-session")
    }

    #[tokio::test]
    async fn test_ensure_is_lazy_and_idempotent() {
        let dir = tempdir().unwrap();
        let sandbox = sandbox_in(&dir);

        assert!(!sandbox.is_initialized());
        assert!(sandbox.sandbox_id().is_none());
        assert!(!dir.path().join("test-session").exists());

        sandbox.ensure().await.unwrap();
        assert!(sandbox.is_initialized());
        assert_eq!(sandbox.sandbox_id().as_deref(), Some("test-session"));
        assert!(dir.path().join("test-session").exists());

        // A second ensure must not re-provision: drop a marker in the root
        // and verify it survives.
        sandbox.write_file("marker.txt", "here").await.unwrap();
        let first_url = sandbox.preview_url().unwrap();
        sandbox.ensure().await.unwrap();
        assert_eq!(sandbox.read_file("marker.txt").await.unwrap(), "here");
        assert_eq!(sandbox.preview_url().unwrap(), first_url);
    }

    #[tokio::test]
    async fn test_concurrent_ensure_provisions_single_root() {
        let dir = tempdir().unwrap();
        let sandbox = Arc::new(sandbox_in(&dir));

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let sandbox = Arc::clone(&sandbox);
                tokio::spawn(async move { sandbox.write_file(&format!("f{i}.txt"), "x").await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        // Exactly one session root under the base directory.
        let roots: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(roots.len(), 1);

        // All writes landed in it.
        let files = sandbox.list_files(".").await.unwrap();
        assert_eq!(files.len(), 8);

        // A single port was allocated and further ensures keep it.
        let port = sandbox.allocated_port.load(Ordering::SeqCst);
        assert_ne!(port, 0);
        sandbox.ensure().await.unwrap();
        assert_eq!(sandbox.allocated_port.load(Ordering::SeqCst), port);
    }

    #[tokio::test]
    async fn test_write_creates_parents_and_reports_size() {
        let dir = tempdir().unwrap();
        let sandbox = sandbox_in(&dir);

        let content = "export default function Page(){}";
        let receipt = sandbox.write_file("app/page.tsx", content).await.unwrap();
        assert_eq!(receipt.size, content.len());

        let on_disk = dir.path().join("test-session/app/page.tsx");
        assert_eq!(std::fs::read_to_string(on_disk).unwrap(), content);
    }

    #[tokio::test]
    async fn test_write_read_round_trip_multibyte_utf8() {
        let dir = tempdir().unwrap();
        let sandbox = sandbox_in(&dir);

        let content = "žluťoučký 🦀 サンドボックス\n";
        let receipt = sandbox.write_file("notes/réadme.md", content).await.unwrap();
        assert_eq!(receipt.size, content.len());
        assert_eq!(receipt.size, content.as_bytes().len());

        let read_back = sandbox.read_file("notes/réadme.md").await.unwrap();
        assert_eq!(read_back, content);
    }

    #[tokio::test]
    async fn test_read_missing_file_is_not_found() {
        let dir = tempdir().unwrap();
        let sandbox = sandbox_in(&dir);

        let err = sandbox.read_file("missing.txt").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_traversal_is_rejected() {
        let dir = tempdir().unwrap();
        let sandbox = sandbox_in(&dir);

        let err = sandbox
            .write_file("../../etc/passwd", "nope")
            .await
            .unwrap_err();
        assert!(err.is_traversal());
    }

    #[tokio::test]
    async fn test_absolute_path_is_contained() {
        let dir = tempdir().unwrap();
        let sandbox = sandbox_in(&dir);

        let receipt = sandbox.write_file("/etc/passwd", "contained").await.unwrap();
        let written = PathBuf::from(&receipt.path);
        let root = std::fs::canonicalize(dir.path().join("test-session")).unwrap();
        assert!(written.starts_with(&root));
        assert!(written.ends_with("etc/passwd"));
        assert_eq!(sandbox.read_file("/etc/passwd").await.unwrap(), "contained");
    }

    #[tokio::test]
    async fn test_list_files_immediate_children_only() {
        let dir = tempdir().unwrap();
        let sandbox = sandbox_in(&dir);

        sandbox.write_file("a.txt", "a").await.unwrap();
        sandbox.write_file("b.tsx", "b").await.unwrap();
        sandbox.write_file("c/nested.txt", "n").await.unwrap();

        let mut names = sandbox.list_files(".").await.unwrap();
        names.sort();
        assert_eq!(names, vec!["a.txt", "b.tsx", "c"]);
    }

    #[tokio::test]
    async fn test_list_files_on_file_fails() {
        let dir = tempdir().unwrap();
        let sandbox = sandbox_in(&dir);

        sandbox.write_file("a.txt", "a").await.unwrap();
        let err = sandbox.list_files("a.txt").await.unwrap_err();
        assert!(matches!(err, SandboxError::FileOperation { .. }));
    }

    #[tokio::test]
    async fn test_list_files_missing_directory_fails() {
        let dir = tempdir().unwrap();
        let sandbox = sandbox_in(&dir);

        let err = sandbox.list_files("no-such-dir").await.unwrap_err();
        assert!(matches!(err, SandboxError::FileOperation { .. }));
    }

    #[tokio::test]
    async fn test_nonzero_exit_code_is_not_an_error() {
        let dir = tempdir().unwrap();
        let sandbox = sandbox_in(&dir);

        let result = sandbox
            .run_command("exit 1", RunOptions::default())
            .await
            .unwrap();
        assert_eq!(result.exit_code, 1);
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_command_captures_output_in_root() {
        let dir = tempdir().unwrap();
        let sandbox = sandbox_in(&dir);

        let result = sandbox
            .run_command("pwd && echo err >&2", RunOptions::default())
            .await
            .unwrap();
        assert!(result.success);
        let root = std::fs::canonicalize(dir.path().join("test-session")).unwrap();
        assert_eq!(result.stdout.trim(), root.to_string_lossy());
        assert_eq!(result.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let dir = tempdir().unwrap();
        let sandbox = sandbox_in(&dir);

        let started = Instant::now();
        let err = sandbox
            .run_command("sleep 10", RunOptions::default().with_timeout(Some(1)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_timed_out_process_is_reaped() {
        let dir = tempdir().unwrap();
        let sandbox = sandbox_in(&dir);

        let err = sandbox
            .run_command(
                "echo $$ > pid.txt; sleep 30",
                RunOptions::default().with_timeout(Some(1)),
            )
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        // The shell recorded its own pid; by the time the error is
        // returned that process must be killed and reaped.
        let pid: i32 = sandbox
            .read_file("pid.txt")
            .await
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        #[cfg(unix)]
        {
            use nix::sys::signal::kill;
            use nix::unistd::Pid;
            assert!(
                kill(Pid::from_raw(pid), None).is_err(),
                "process {pid} still alive after timeout"
            );
        }
        #[cfg(not(unix))]
        let _ = pid;
    }

    #[tokio::test]
    async fn test_background_command_returns_immediately() {
        let dir = tempdir().unwrap();
        let sandbox = sandbox_in(&dir);

        let result = sandbox
            .run_command("sleep 30", RunOptions::default().in_background())
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.background);
        assert!(result.pid.is_some());

        // Teardown must reap the detached process.
        sandbox.destroy(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_dev_server_port_is_stable_and_server_reused() {
        let dir = tempdir().unwrap();
        let config = LocalConfig {
            dev_command: "sleep 30".to_string(),
            ..config_in(&dir)
        };
        let sandbox = LocalSandbox::new(config, "test-session");

        let first = sandbox.start_dev_server(".", None).await.unwrap();
        assert!(!first.reused);
        assert!(first.preview_url.contains(&first.port.to_string()));

        let second = sandbox.start_dev_server(".", None).await.unwrap();
        assert!(second.reused);
        assert_eq!(second.port, first.port);
        assert_eq!(second.preview_url, first.preview_url);
        assert_eq!(second.pid, first.pid);

        sandbox.destroy(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_reused_server_reports_explicit_port() {
        let dir = tempdir().unwrap();
        let config = LocalConfig {
            dev_command: "sleep 30".to_string(),
            ..config_in(&dir)
        };
        let sandbox = LocalSandbox::new(config, "test-session");

        let first = sandbox.start_dev_server(".", Some(4567)).await.unwrap();
        assert_eq!(first.port, 4567);
        assert!(first.preview_url.contains("4567"));

        // A later call without a port must report the port the running
        // server is bound to, not the session's originally allocated one.
        let second = sandbox.start_dev_server(".", None).await.unwrap();
        assert!(second.reused);
        assert_eq!(second.port, 4567);
        assert_eq!(second.preview_url, first.preview_url);

        sandbox.destroy(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_dev_server_immediate_exit_reports_output() {
        let dir = tempdir().unwrap();
        let config = LocalConfig {
            dev_command: "echo 'npm ERR! missing script: dev' >&2; exit 1".to_string(),
            ..config_in(&dir)
        };
        let sandbox = LocalSandbox::new(config, "test-session");

        let err = sandbox.start_dev_server(".", None).await.unwrap_err();
        match err {
            SandboxError::DevServerStart { output, .. } => {
                assert!(output.contains("missing script"), "output was: {output}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let dir = tempdir().unwrap();
        let sandbox = sandbox_in(&dir);

        // Never initialized.
        sandbox.destroy(false).await.unwrap();

        sandbox.ensure().await.unwrap();
        sandbox.destroy(false).await.unwrap();
        assert!(!sandbox.is_initialized());
        assert!(sandbox.preview_url().is_none());

        // Twice in a row.
        sandbox.destroy(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_destroy_keeps_files_by_default() {
        let dir = tempdir().unwrap();
        let sandbox = sandbox_in(&dir);

        sandbox.write_file("keep.txt", "artifact").await.unwrap();
        sandbox.destroy(false).await.unwrap();
        assert!(dir.path().join("test-session/keep.txt").exists());
    }

    #[tokio::test]
    async fn test_destroy_delete_files_removes_root() {
        let dir = tempdir().unwrap();
        let sandbox = sandbox_in(&dir);

        sandbox.write_file("gone.txt", "x").await.unwrap();
        sandbox.destroy(true).await.unwrap();
        assert!(!dir.path().join("test-session").exists());
    }

    #[tokio::test]
    async fn test_ensure_after_destroy_reprovisions() {
        let dir = tempdir().unwrap();
        let sandbox = sandbox_in(&dir);

        sandbox.ensure().await.unwrap();
        sandbox.destroy(true).await.unwrap();

        sandbox.write_file("again.txt", "fresh").await.unwrap();
        assert!(sandbox.is_initialized());
        assert!(dir.path().join("test-session/again.txt").exists());
    }

    #[tokio::test]
    async fn test_keep_alive_reflects_initialization() {
        let dir = tempdir().unwrap();
        let sandbox = sandbox_in(&dir);

        assert!(!sandbox.keep_alive(1800).await.unwrap());
        sandbox.ensure().await.unwrap();
        assert!(sandbox.keep_alive(1800).await.unwrap());
    }

    #[tokio::test]
    async fn test_get_preview_url_uses_allocated_port() {
        let dir = tempdir().unwrap();
        let sandbox = sandbox_in(&dir);

        let url = sandbox.get_preview_url(None).await.unwrap();
        let port = sandbox.allocated_port.load(Ordering::SeqCst);
        assert_eq!(url, format!("http://localhost:{port}"));

        let explicit = sandbox.get_preview_url(Some(4242)).await.unwrap();
        assert_eq!(explicit, "http://localhost:4242");
    }
}
