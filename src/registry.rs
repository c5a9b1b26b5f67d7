//! Session registry: one sandbox per session id.
//!
//! The registry is the single owner of live sandbox handles. Callers go
//! through it so that two requests for the same session always see the same
//! sandbox, and so teardown has one place to find everything still running.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::sandbox::{create_sandbox, Sandbox, SandboxError};

/// A registered session.
struct Entry {
    sandbox: Arc<dyn Sandbox>,
    created_at: DateTime<Utc>,
}

/// Summary of a registered session, for listings.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionInfo {
    /// The session identifier.
    pub session_id: String,
    /// Backend the session runs on.
    pub backend: String,
    /// Whether the sandbox has been provisioned.
    pub initialized: bool,
    /// When the session was registered.
    pub created_at: DateTime<Utc>,
}

/// Maps session ids to their sandbox handles.
pub struct SessionRegistry {
    config: Config,
    sessions: Mutex<HashMap<String, Entry>>,
}

impl SessionRegistry {
    /// Creates an empty registry using `config` for new sandboxes.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the sandbox for `session_id`, creating and registering one
    /// if the session is new. The sandbox is not provisioned here; that
    /// happens lazily on its first operation.
    pub async fn get_or_create(
        &self,
        session_id: &str,
    ) -> Result<Arc<dyn Sandbox>, SandboxError> {
        let mut sessions = self.sessions.lock().await;

        if let Some(entry) = sessions.get(session_id) {
            debug!(session_id, "reusing registered sandbox");
            return Ok(Arc::clone(&entry.sandbox));
        }

        let sandbox = create_sandbox(&self.config, session_id)?;
        info!(session_id, backend = sandbox.name(), "session registered");
        sessions.insert(
            session_id.to_string(),
            Entry {
                sandbox: Arc::clone(&sandbox),
                created_at: Utc::now(),
            },
        );
        Ok(sandbox)
    }

    /// Registers a session under a fresh generated id and returns both.
    pub async fn create(&self) -> Result<(String, Arc<dyn Sandbox>), SandboxError> {
        let session_id = Uuid::new_v4().to_string();
        let sandbox = self.get_or_create(&session_id).await?;
        Ok((session_id, sandbox))
    }

    /// Looks up an existing session without creating one.
    pub async fn get(&self, session_id: &str) -> Option<Arc<dyn Sandbox>> {
        let sessions = self.sessions.lock().await;
        sessions.get(session_id).map(|e| Arc::clone(&e.sandbox))
    }

    /// Removes a session and destroys its sandbox. Destroy failures are
    /// logged, not returned; the session is deregistered either way so a
    /// wedged sandbox cannot pin its id forever.
    pub async fn remove(&self, session_id: &str, delete_files: bool) -> bool {
        let entry = {
            let mut sessions = self.sessions.lock().await;
            sessions.remove(session_id)
        };

        let Some(entry) = entry else {
            debug!(session_id, "remove of unknown session is a no-op");
            return false;
        };

        if let Err(e) = entry.sandbox.destroy(delete_files).await {
            warn!(session_id, "failed to destroy sandbox: {e}");
        }
        info!(session_id, "session removed");
        true
    }

    /// Snapshot of all registered sessions, oldest first.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.lock().await;
        let mut infos: Vec<SessionInfo> = sessions
            .iter()
            .map(|(id, entry)| SessionInfo {
                session_id: id.clone(),
                backend: entry.sandbox.name().to_string(),
                initialized: entry.sandbox.is_initialized(),
                created_at: entry.created_at,
            })
            .collect();
        infos.sort_by_key(|info| info.created_at);
        infos
    }

    /// Destroys every registered session. Used at shutdown.
    pub async fn remove_all(&self, delete_files: bool) {
        let ids: Vec<String> = {
            let sessions = self.sessions.lock().await;
            sessions.keys().cloned().collect()
        };
        for id in ids {
            self.remove(&id, delete_files).await;
        }
    }
}
