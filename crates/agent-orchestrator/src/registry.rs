//! In-memory map from issue id to its single live session.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, warn};

use crate::error::OrchestratorError;
use crate::session::{Session, SessionHandle};

/// Holds at most one live session per issue.
///
/// Callers serialize all work on one issue through [`SessionRegistry::lock_issue`]
/// so concurrent webhook deliveries cannot both start a session.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionHandle>>,
    issue_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclusive access to one issue for the duration of the guard.
    pub async fn lock_issue(&self, issue_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.issue_locks.lock().await;
            Arc::clone(locks.entry(issue_id.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Whether the issue has a session that has not exited.
    pub async fn has(&self, issue_id: &str) -> bool {
        let Some(handle) = self.get(issue_id).await else {
            return false;
        };
        let live = handle.lock().await.is_live();
        live
    }

    pub async fn get(&self, issue_id: &str) -> Option<SessionHandle> {
        self.sessions.read().await.get(issue_id).cloned()
    }

    /// Register a session. Fails if a live session already exists;
    /// an exited one is replaced.
    pub async fn add(
        &self,
        issue_id: &str,
        session: Session,
    ) -> Result<SessionHandle, OrchestratorError> {
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(issue_id) {
            if existing.lock().await.is_live() {
                return Err(OrchestratorError::SessionAlreadyActive {
                    issue_id: issue_id.to_string(),
                });
            }
            debug!(issue_id = %issue_id, "Replacing exited session");
        }

        let handle = Arc::new(Mutex::new(session));
        sessions.insert(issue_id.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Swap in a new session regardless of the old one's state.
    ///
    /// Only the token-limit restart uses this; the previous runner must
    /// already be killed.
    pub async fn replace(&self, issue_id: &str, session: Session) -> SessionHandle {
        let handle = Arc::new(Mutex::new(session));
        let previous = self
            .sessions
            .write()
            .await
            .insert(issue_id.to_string(), Arc::clone(&handle));
        if let Some(previous) = previous {
            let mut previous = previous.lock().await;
            if previous.is_live() {
                warn!(issue_id = %issue_id, "Replaced a session that was still live");
                previous.request_stop();
            }
        }
        handle
    }

    pub async fn remove(&self, issue_id: &str) -> Option<SessionHandle> {
        self.sessions.write().await.remove(issue_id)
    }

    /// Remove the entry only if it is still `handle`.
    pub async fn remove_if(&self, issue_id: &str, handle: &SessionHandle) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(issue_id) {
            Some(current) if Arc::ptr_eq(current, handle) => {
                sessions.remove(issue_id);
                true
            }
            _ => false,
        }
    }

    pub async fn all(&self) -> Vec<(String, SessionHandle)> {
        self.sessions
            .read()
            .await
            .iter()
            .map(|(id, handle)| (id.clone(), Arc::clone(handle)))
            .collect()
    }

    /// Number of live sessions.
    pub async fn live_count(&self) -> usize {
        let mut count = 0;
        for (_, handle) in self.all().await {
            if handle.lock().await.is_live() {
                count += 1;
            }
        }
        count
    }
}
