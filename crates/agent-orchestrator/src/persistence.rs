//! Local snapshot of agent sessions for restart recovery.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::agent_session::AgentSessionState;

const STATE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateFile {
    version: u32,
    saved_at: DateTime<Utc>,
    agent_sessions: AgentSessionState,
}

/// JSON file holding the last [`AgentSessionState`].
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the snapshot, replacing the previous file atomically.
    pub async fn save(&self, state: &AgentSessionState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let file = StateFile {
            version: STATE_VERSION,
            saved_at: Utc::now(),
            agent_sessions: state.clone(),
        };
        let json = serde_json::to_vec_pretty(&file).context("serializing session state")?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replacing {}", self.path.display()))?;

        info!(
            path = %self.path.display(),
            sessions = state.sessions.len(),
            "Saved agent session state"
        );
        Ok(())
    }

    /// Read the snapshot; `None` when no file exists yet.
    pub async fn load(&self) -> Result<Option<AgentSessionState>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No saved session state");
                return Ok(None);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", self.path.display()));
            }
        };

        let file: StateFile = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        if file.version != STATE_VERSION {
            anyhow::bail!(
                "unsupported state version {} in {}",
                file.version,
                self.path.display()
            );
        }
        Ok(Some(file.agent_sessions))
    }
}
