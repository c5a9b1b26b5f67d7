//! TCP port allocation for dev servers.
//!
//! Ports are probed for live bind-ability rather than tracked in an
//! in-memory table: processes outside the manager can occupy ports at any
//! time, so only a successful bind-and-release proves availability.

use tokio::net::TcpListener;
use tracing::debug;

use super::error::SandboxError;

/// Port 3000 is reserved for the host application's own frontend; dev
/// server allocation starts above it.
pub const DEFAULT_START_PORT: u16 = 3001;

/// Number of consecutive ports probed before giving up.
const PROBE_WINDOW: u16 = 100;

/// Finds the first bindable TCP port at or above `start`.
///
/// Probes up to 100 ports. The listener is dropped immediately after a
/// successful bind, releasing the port for the caller to use.
pub(crate) async fn find_available_port(start: u16) -> Result<u16, SandboxError> {
    for offset in 0..PROBE_WINDOW {
        let Some(port) = start.checked_add(offset) else {
            break;
        };
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => {
                drop(listener);
                debug!(port, "port is available");
                return Ok(port);
            }
            Err(_) => {
                debug!(port, "port is in use, trying next");
            }
        }
    }
    Err(SandboxError::port_exhausted(start, PROBE_WINDOW))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_finds_port_at_or_above_start() {
        let port = find_available_port(DEFAULT_START_PORT).await.unwrap();
        assert!(port >= DEFAULT_START_PORT);
    }

    #[tokio::test]
    async fn test_skips_occupied_port() {
        // Bind an ephemeral port, then ask for exactly that port: the probe
        // must move past it.
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let occupied = listener.local_addr().unwrap().port();

        let port = find_available_port(occupied).await.unwrap();
        assert_ne!(port, occupied);
        assert!(port > occupied);
    }

    #[tokio::test]
    async fn test_returned_port_is_bindable() {
        let port = find_available_port(DEFAULT_START_PORT).await.unwrap();
        let listener = TcpListener::bind(("127.0.0.1", port)).await;
        assert!(listener.is_ok());
    }
}
