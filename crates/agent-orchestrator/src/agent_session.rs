//! Tracker-facing agent sessions.
//!
//! [`AgentSessionManager`] turns the runner's message stream into an
//! [`AgentSession`] plus an append-only log of [`AgentSessionEntry`]
//! records, and mirrors each entry to the tracker as an activity.
//!
//! Entries are the source of truth. Posting an activity is best-effort:
//! a failed post is logged and never retried, and never blocks the next
//! entry. Syncs for one session are serialized so the tracker sees them in
//! receipt order.

use std::collections::HashMap;
use std::sync::Arc;

use agent_runner::{AgentMessage, ConversationMessage, ResultMessage, SystemMessage};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use linear::{ActivityContent, LinearError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Destination for activities.
#[async_trait]
pub trait ActivitySink: Send + Sync {
    /// Post one activity; returns the tracker's activity id when known.
    async fn post_activity(
        &self,
        agent_session_id: &str,
        content: ActivityContent,
    ) -> Result<Option<String>, LinearError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentSessionStatus {
    Active,
    AwaitingInput,
    Complete,
    Error,
}

impl AgentSessionStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    User,
    Assistant,
    System,
    Result,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSessionMetadata {
    pub model: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    pub permission_mode: Option<String>,
    pub api_key_source: Option<String>,
    pub total_cost_usd: Option<f64>,
    pub usage: Option<Value>,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSession {
    pub id: String,
    pub status: AgentSessionStatus,
    pub issue_id: String,
    /// Underlying agent conversation id, once reported
    pub claude_session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: AgentSessionMetadata,
    /// Whether the id exists on the tracker and activities are posted
    #[serde(default)]
    pub synced: bool,
}

/// One streamed message, recorded once and never edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSessionEntry {
    pub id: String,
    pub session_id: String,
    pub kind: EntryKind,
    pub content: String,
    /// First tool use of the message
    pub tool_use_id: Option<String>,
    pub tool_name: Option<String>,
    pub tool_input: Option<Value>,
    /// Every tool use of the message, in order
    #[serde(default)]
    pub tool_use_ids: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub is_error: bool,
    /// Tracker activity mirroring this entry
    pub activity_id: Option<String>,
}

impl AgentSessionEntry {
    fn new(session_id: &str, kind: EntryKind, content: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            kind,
            content,
            tool_use_id: None,
            tool_name: None,
            tool_input: None,
            tool_use_ids: Vec::new(),
            timestamp: Utc::now(),
            duration_ms: None,
            is_error: false,
            activity_id: None,
        }
    }

    /// Activity this entry maps to; `None` for entries that are not mirrored.
    #[must_use]
    pub fn activity(&self) -> Option<ActivityContent> {
        match self.kind {
            EntryKind::User => None,
            EntryKind::Assistant => match &self.tool_name {
                Some(tool) => {
                    let parameter = self
                        .tool_input
                        .as_ref()
                        .map_or_else(|| self.content.clone(), Value::to_string);
                    Some(ActivityContent::action(tool.clone(), parameter))
                }
                None if self.content.trim().is_empty() => None,
                None => Some(ActivityContent::thought(self.content.clone())),
            },
            EntryKind::System => Some(ActivityContent::thought(self.content.clone())),
            EntryKind::Result if self.is_error => Some(ActivityContent::error(self.content.clone())),
            EntryKind::Result => Some(ActivityContent::response(self.content.clone())),
        }
    }
}

/// Serializable view of every session and its entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSessionState {
    pub sessions: Vec<AgentSession>,
    pub entries: HashMap<String, Vec<AgentSessionEntry>>,
}

pub struct AgentSessionManager {
    sink: Arc<dyn ActivitySink>,
    sessions: RwLock<HashMap<String, AgentSession>>,
    /// Local ids waiting for the agent's `system/init`, mapped to their issue
    pending: RwLock<HashMap<String, String>>,
    entries: RwLock<HashMap<String, Vec<AgentSessionEntry>>>,
    sync_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AgentSessionManager {
    #[must_use]
    pub fn new(sink: Arc<dyn ActivitySink>) -> Self {
        Self {
            sink,
            sessions: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashMap::new()),
            entries: RwLock::new(HashMap::new()),
            sync_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Register a session the tracker already created. It is active at once.
    pub async fn create_tracker_session(&self, id: &str, issue_id: &str) -> AgentSession {
        let now = Utc::now();
        let session = AgentSession {
            id: id.to_string(),
            status: AgentSessionStatus::Active,
            issue_id: issue_id.to_string(),
            claude_session_id: None,
            created_at: now,
            updated_at: now,
            metadata: AgentSessionMetadata::default(),
            synced: true,
        };
        self.sessions
            .write()
            .await
            .insert(id.to_string(), session.clone());
        info!(agent_session_id = %id, issue_id = %issue_id, "Tracker agent session active");
        session
    }

    /// Reserve a local id; the session becomes active on `system/init`.
    pub async fn create_local_session(&self, issue_id: &str) -> String {
        let id = Uuid::new_v4().to_string();
        self.pending
            .write()
            .await
            .insert(id.clone(), issue_id.to_string());
        debug!(agent_session_id = %id, issue_id = %issue_id, "Local agent session reserved");
        id
    }

    /// Drop a local id that never saw a message. Returns whether it was
    /// still reserved.
    pub async fn release_reservation(&self, id: &str) -> bool {
        let released = self.pending.write().await.remove(id).is_some();
        if released {
            debug!(agent_session_id = %id, "Released unused local agent session");
        }
        released
    }

    pub async fn is_reserved(&self, id: &str) -> bool {
        self.pending.read().await.contains_key(id)
    }

    pub async fn get(&self, id: &str) -> Option<AgentSession> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Entries of a session in receipt order.
    pub async fn entries(&self, id: &str) -> Vec<AgentSessionEntry> {
        self.entries
            .read()
            .await
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn all(&self) -> Vec<AgentSession> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn sessions_for_issue(&self, issue_id: &str) -> Vec<AgentSession> {
        let mut sessions: Vec<_> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.issue_id == issue_id)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    /// Record one streamed message and mirror it to the tracker.
    pub async fn handle_message(&self, id: &str, message: &AgentMessage) {
        let sync_lock = self.sync_lock(id).await;
        let _sync = sync_lock.lock().await;

        if !self.ensure_active(id, message).await {
            debug!(agent_session_id = %id, kind = message.kind(), "Message for unknown agent session");
            return;
        }

        let entry = match message {
            AgentMessage::System(system) => self.handle_system(id, system).await,
            AgentMessage::User(user) => Self::conversation_entry(id, EntryKind::User, user),
            AgentMessage::Assistant(assistant) => {
                Self::conversation_entry(id, EntryKind::Assistant, assistant)
            }
            AgentMessage::Result(result) => {
                self.handle_result(id, result, message.is_token_limit()).await
            }
        };

        let synced = self.touch(id, message).await;
        let index = self.append(id, entry.clone()).await;

        // The restart path owns token-limit results; they are not user-facing.
        if synced && !message.is_token_limit() {
            self.sync_entry(id, index, &entry).await;
        }
    }

    /// Post an activity outside the message stream, e.g. an acknowledgement.
    pub async fn post_activity(&self, id: &str, content: ActivityContent) -> Option<String> {
        let synced = self.sessions.read().await.get(id).is_some_and(|s| s.synced);
        if !synced {
            return None;
        }
        let sync_lock = self.sync_lock(id).await;
        let _sync = sync_lock.lock().await;
        match self.sink.post_activity(id, content).await {
            Ok(activity_id) => activity_id,
            Err(e) => {
                warn!(agent_session_id = %id, error = %e, "Failed to post agent activity");
                None
            }
        }
    }

    /// Move a session to `error` after a runner failure and report it.
    pub async fn fail_session(&self, id: &str, message: &str) {
        let changed = {
            let mut sessions = self.sessions.write().await;
            match sessions.get_mut(id) {
                Some(session) if !session.status.is_terminal() => {
                    session.status = AgentSessionStatus::Error;
                    session.updated_at = Utc::now();
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.post_activity(id, ActivityContent::error(message)).await;
        }
    }

    /// Set a status directly; terminal states are never left.
    pub async fn set_status(&self, id: &str, status: AgentSessionStatus) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(id) else {
            return false;
        };
        if session.status.is_terminal() {
            return false;
        }
        session.status = status;
        session.updated_at = Utc::now();
        true
    }

    /// Drop finished sessions whose last update is older than `retention`.
    pub async fn cleanup(&self, retention: Duration) -> usize {
        let cutoff = Utc::now() - retention;
        let expired: Vec<String> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.status.is_terminal() && s.updated_at < cutoff)
            .map(|s| s.id.clone())
            .collect();

        if expired.is_empty() {
            return 0;
        }

        {
            let mut sessions = self.sessions.write().await;
            let mut entries = self.entries.write().await;
            let mut locks = self.sync_locks.lock().await;
            for id in &expired {
                sessions.remove(id);
                entries.remove(id);
                locks.remove(id);
            }
        }
        info!(removed = expired.len(), "Garbage-collected agent sessions");
        expired.len()
    }

    pub async fn snapshot(&self) -> AgentSessionState {
        let mut sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        sessions.sort_by_key(|s| s.created_at);
        AgentSessionState {
            sessions,
            entries: self.entries.read().await.clone(),
        }
    }

    /// Load sessions from a snapshot, keeping any already in memory.
    pub async fn restore(&self, state: AgentSessionState) -> usize {
        let mut sessions = self.sessions.write().await;
        let mut entries = self.entries.write().await;
        let mut restored = 0;
        for session in state.sessions {
            if sessions.contains_key(&session.id) {
                continue;
            }
            if let Some(log) = state.entries.get(&session.id) {
                entries.insert(session.id.clone(), log.clone());
            }
            sessions.insert(session.id.clone(), session);
            restored += 1;
        }
        restored
    }

    async fn sync_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.sync_locks.lock().await;
        Arc::clone(locks.entry(id.to_string()).or_default())
    }

    /// Make sure a session exists, activating a reserved local one.
    async fn ensure_active(&self, id: &str, message: &AgentMessage) -> bool {
        if self.sessions.read().await.contains_key(id) {
            return true;
        }
        let Some(issue_id) = self.pending.write().await.remove(id) else {
            return false;
        };
        if !matches!(message, AgentMessage::System(s) if s.is_init()) {
            debug!(agent_session_id = %id, "Activating agent session before system/init");
        }
        let now = Utc::now();
        self.sessions.write().await.insert(
            id.to_string(),
            AgentSession {
                id: id.to_string(),
                status: AgentSessionStatus::Active,
                issue_id,
                claude_session_id: None,
                created_at: now,
                updated_at: now,
                metadata: AgentSessionMetadata::default(),
                synced: false,
            },
        );
        true
    }

    async fn handle_system(&self, id: &str, system: &SystemMessage) -> AgentSessionEntry {
        if system.is_init() {
            let mut sessions = self.sessions.write().await;
            if let Some(session) = sessions.get_mut(id) {
                let metadata = &mut session.metadata;
                metadata.model.clone_from(&system.model);
                metadata.tools.clone_from(&system.tools);
                metadata.permission_mode.clone_from(&system.permission_mode);
                metadata.api_key_source.clone_from(&system.api_key_source);
            }
        }

        let content = match (&system.model, system.is_init()) {
            (Some(model), true) => format!("Agent session started with model {model}"),
            (None, true) => "Agent session started".to_string(),
            _ => format!("System: {}", system.subtype),
        };
        AgentSessionEntry::new(id, EntryKind::System, content)
    }

    fn conversation_entry(
        id: &str,
        kind: EntryKind,
        message: &ConversationMessage,
    ) -> AgentSessionEntry {
        let mut entry = AgentSessionEntry::new(id, kind, message.message.content_text());
        let tool_uses = message.message.tool_uses();
        if let Some(first) = tool_uses.first() {
            entry.tool_use_id = Some(first.id.to_string());
            entry.tool_name = Some(first.name.to_string());
            entry.tool_input = Some(first.input.clone());
        }
        entry.tool_use_ids = tool_uses.iter().map(|t| t.id.to_string()).collect();
        entry
    }

    /// A token-limit result closes the session as complete: the conversation
    /// continues in a fresh session.
    async fn handle_result(
        &self,
        id: &str,
        result: &ResultMessage,
        token_limit: bool,
    ) -> AgentSessionEntry {
        {
            let mut sessions = self.sessions.write().await;
            if let Some(session) = sessions.get_mut(id) {
                if !session.status.is_terminal() {
                    session.status = if result.is_success() || token_limit {
                        AgentSessionStatus::Complete
                    } else {
                        AgentSessionStatus::Error
                    };
                }
                let metadata = &mut session.metadata;
                if let Some(cost) = result.total_cost_usd {
                    metadata.total_cost_usd = Some(metadata.total_cost_usd.unwrap_or(0.0) + cost);
                }
                if result.usage.is_some() {
                    metadata.usage.clone_from(&result.usage);
                }
                if result.duration_ms.is_some() {
                    metadata.duration_ms = result.duration_ms;
                }
            }
        }

        let content = result
            .result
            .clone()
            .unwrap_or_else(|| format!("Agent finished: {}", result.subtype));
        let mut entry = AgentSessionEntry::new(id, EntryKind::Result, content);
        entry.duration_ms = result.duration_ms;
        entry.is_error = !result.is_success();
        entry
    }

    /// Refresh `updated_at` and capture the conversation id. Returns whether
    /// the session mirrors activities to the tracker.
    async fn touch(&self, id: &str, message: &AgentMessage) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(id) else {
            return false;
        };
        session.updated_at = Utc::now();
        if session.claude_session_id.is_none() {
            if let Some(claude_id) = message.session_id() {
                session.claude_session_id = Some(claude_id.to_string());
            }
        }
        session.synced
    }

    async fn append(&self, id: &str, entry: AgentSessionEntry) -> usize {
        let mut entries = self.entries.write().await;
        let log = entries.entry(id.to_string()).or_default();
        log.push(entry);
        log.len() - 1
    }

    async fn sync_entry(&self, id: &str, index: usize, entry: &AgentSessionEntry) {
        let Some(content) = entry.activity() else {
            return;
        };
        let kind = content.kind();
        match self.sink.post_activity(id, content).await {
            Ok(Some(activity_id)) => {
                debug!(agent_session_id = %id, activity_id = %activity_id, kind, "Synced activity");
                if let Some(stored) = self
                    .entries
                    .write()
                    .await
                    .get_mut(id)
                    .and_then(|log| log.get_mut(index))
                {
                    stored.activity_id = Some(activity_id);
                }
            }
            Ok(None) => debug!(agent_session_id = %id, kind, "Activity posted without id"),
            Err(e) => {
                warn!(agent_session_id = %id, kind, error = %e, "Failed to sync activity");
            }
        }
    }
}
