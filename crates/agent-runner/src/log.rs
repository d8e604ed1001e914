//! Append-only JSONL log of everything the agent streamed.
//!
//! The file starts life as `session-<started>.jsonl` because the
//! conversation id is unknown until the agent reports it. On the first
//! message that carries an id the file is renamed to
//! `session-<id>-<started>.jsonl`. Every write is best-effort.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::messages::AgentMessage;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionMetadata<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    started_at: DateTime<Utc>,
    working_directory: &'a Path,
    workspace_name: &'a str,
    timestamp: DateTime<Utc>,
}

/// JSONL log owned by one runner.
#[derive(Debug)]
pub struct SessionLog {
    dir: PathBuf,
    stamp: String,
    path: PathBuf,
    session_id: Option<String>,
    file: Option<File>,
}

impl SessionLog {
    /// Open a new log under `<logs_dir>/<workspace_name>/` and write the metadata line.
    pub async fn create(logs_dir: &Path, workspace_name: &str, working_directory: &Path) -> Self {
        let started_at = Utc::now();
        let stamp = started_at.format("%Y%m%dT%H%M%S%.3fZ").to_string();
        let dir = logs_dir.join(workspace_name);
        let path = dir.join(format!("session-{stamp}.jsonl"));

        let mut log = Self {
            dir,
            stamp,
            path,
            session_id: None,
            file: None,
        };

        if let Err(e) = fs::create_dir_all(&log.dir).await {
            warn!(dir = %log.dir.display(), error = %e, "Failed to create session log directory");
            return log;
        }
        log.file = open_append(&log.path).await;

        let metadata = SessionMetadata {
            kind: "session-metadata",
            started_at,
            working_directory,
            workspace_name,
            timestamp: Utc::now(),
        };
        match serde_json::to_string(&metadata) {
            Ok(line) => log.write_line(&line).await,
            Err(e) => warn!(error = %e, "Failed to serialize session metadata"),
        }
        log
    }

    /// Current log file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one streamed message, migrating the file once the id is known.
    pub async fn append(&mut self, message: &AgentMessage) {
        if self.session_id.is_none() {
            if let Some(session_id) = message.session_id() {
                self.migrate(session_id).await;
            }
        }

        match serde_json::to_string(message) {
            Ok(line) => self.write_line(&line).await,
            Err(e) => warn!(error = %e, "Failed to serialize agent message for log"),
        }
    }

    /// Flush and close the file.
    pub async fn close(&mut self) {
        if let Some(mut file) = self.file.take() {
            if let Err(e) = file.flush().await {
                debug!(path = %self.path.display(), error = %e, "Failed to flush session log");
            }
        }
    }

    async fn migrate(&mut self, session_id: &str) {
        self.session_id = Some(session_id.to_string());
        let target = self
            .dir
            .join(format!("session-{session_id}-{}.jsonl", self.stamp));

        self.close().await;
        match fs::rename(&self.path, &target).await {
            Ok(()) => {
                debug!(from = %self.path.display(), to = %target.display(), "Migrated session log");
                self.path = target;
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to rename session log");
            }
        }
        self.file = open_append(&self.path).await;
    }

    async fn write_line(&mut self, line: &str) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        if let Err(e) = file.write_all(&buf).await {
            warn!(path = %self.path.display(), error = %e, "Failed to write session log");
        }
    }
}

async fn open_append(path: &Path) -> Option<File> {
    match OpenOptions::new().create(true).append(true).open(path).await {
        Ok(file) => Some(file),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to open session log");
            None
        }
    }
}
