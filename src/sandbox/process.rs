//! Background process tracking and shutdown.
//!
//! Dev servers and background commands outlive the call that spawned them;
//! the session keeps a handle per process so `destroy()` can kill them
//! deterministically instead of leaking them. Only the minimal identity is
//! kept: the pid for signalling plus the child for waiting.

use std::time::Duration;

use tokio::process::Child;
use tokio::time::timeout;
use tracing::{debug, warn};

/// How long a process gets to exit after SIGTERM before it is killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A background process owned by a sandbox session.
#[derive(Debug)]
pub(crate) struct ProcessHandle {
    pid: u32,
    child: Child,
}

impl ProcessHandle {
    /// Wraps a freshly spawned child.
    pub(crate) fn new(child: Child) -> Self {
        let pid = child.id().unwrap_or_default();
        Self { pid, child }
    }

    /// The OS process id.
    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    /// Returns true if the process has not exited yet.
    pub(crate) fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Terminates the process: graceful signal first, then a hard kill if
    /// it does not exit within the grace period. Best-effort; failures are
    /// logged and swallowed so teardown always proceeds.
    pub(crate) async fn shutdown(mut self) {
        if !self.is_running() {
            debug!(pid = self.pid, "process already exited");
            return;
        }

        terminate(self.pid);

        match timeout(SHUTDOWN_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(pid = self.pid, ?status, "process terminated gracefully");
            }
            Ok(Err(e)) => {
                warn!(pid = self.pid, "error waiting for process: {e}");
            }
            Err(_) => {
                warn!(
                    pid = self.pid,
                    "process did not terminate within {}s, killing it",
                    SHUTDOWN_GRACE.as_secs()
                );
                if let Err(e) = self.child.kill().await {
                    warn!(pid = self.pid, "failed to kill process: {e}");
                }
            }
        }
    }
}

/// Sends SIGTERM on unix; elsewhere there is no graceful signal, so the
/// hard kill in `shutdown` does the work.
#[cfg(unix)]
fn terminate(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    #[allow(clippy::cast_possible_wrap)]
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        warn!(pid, "failed to send SIGTERM: {e}");
    }
}

#[cfg(not(unix))]
fn terminate(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    fn spawn_sleep(seconds: u32) -> Child {
        Command::new("sh")
            .arg("-c")
            .arg(format!("sleep {seconds}"))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn sleep")
    }

    #[tokio::test]
    async fn test_running_process_reports_running() {
        let mut handle = ProcessHandle::new(spawn_sleep(30));
        assert!(handle.is_running());
        assert!(handle.pid() > 0);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_terminates_process() {
        let handle = ProcessHandle::new(spawn_sleep(30));
        let pid = handle.pid();
        handle.shutdown().await;

        // A second signal to the pid must fail: the process is gone.
        #[cfg(unix)]
        {
            use nix::sys::signal::kill;
            use nix::unistd::Pid;
            #[allow(clippy::cast_possible_wrap)]
            let alive = kill(Pid::from_raw(pid as i32), None).is_ok();
            assert!(!alive, "process {pid} still running after shutdown");
        }
        #[cfg(not(unix))]
        let _ = pid;
    }

    #[tokio::test]
    async fn test_shutdown_of_exited_process_is_noop() {
        let mut handle = ProcessHandle::new(spawn_sleep(0));
        // Wait for natural exit.
        let _ = handle.child.wait().await;
        handle.shutdown().await;
    }
}
