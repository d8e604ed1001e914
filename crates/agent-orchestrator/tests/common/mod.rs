//! Hand-written fakes for the tracker, workspace and agent seams.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agent_orchestrator::error::WorkspaceError;
use agent_orchestrator::{
    AgentSettings, AppContext, Issue, IssueTracker, Orchestrator, Workspace, WorkspaceProvisioner,
};
use agent_runner::{AgentBackend, AgentMessage, MessageStream, QueryRequest, RunnerError};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use linear::{AgentActivityCreateInput, CommentCreated, LinearError};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

pub const AGENT_USER: &str = "agent-user";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedComment {
    pub id: String,
    pub issue_id: String,
    pub body: String,
    pub parent_id: Option<String>,
}

/// Tracker that records every call.
#[derive(Default)]
pub struct FakeTracker {
    pub issues: Mutex<HashMap<String, Issue>>,
    pub comments: Mutex<Vec<PostedComment>>,
    pub plain_comments: Mutex<Vec<(String, String)>>,
    pub resolutions: Mutex<Vec<(String, Option<String>)>>,
    pub activities: Mutex<Vec<AgentActivityCreateInput>>,
    /// Ids handed out to created comments, in order
    pub comment_ids: Mutex<VecDeque<String>>,
    pub fail_comments: AtomicBool,
    pub reject_comments: AtomicBool,
    pub tracker_sessions: AtomicBool,
    next_id: AtomicUsize,
}

impl FakeTracker {
    pub fn new() -> Arc<Self> {
        let tracker = Self::default();
        tracker.tracker_sessions.store(true, Ordering::SeqCst);
        Arc::new(tracker)
    }

    pub async fn add_issue(&self, issue: Issue) {
        self.issues.lock().await.insert(issue.id.clone(), issue);
    }

    pub async fn queue_comment_ids(&self, ids: &[&str]) {
        self.comment_ids
            .lock()
            .await
            .extend(ids.iter().map(ToString::to_string));
    }

    pub async fn comments(&self) -> Vec<PostedComment> {
        self.comments.lock().await.clone()
    }

    pub async fn resolutions(&self) -> Vec<(String, Option<String>)> {
        self.resolutions.lock().await.clone()
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[async_trait]
impl IssueTracker for FakeTracker {
    async fn viewer_id(&self) -> Result<String, LinearError> {
        Ok(AGENT_USER.to_string())
    }

    async fn fetch_issue(&self, issue_id: &str) -> Result<Issue, LinearError> {
        self.issues
            .lock()
            .await
            .get(issue_id)
            .cloned()
            .ok_or_else(|| LinearError::GraphQl(vec![format!("Entity not found: {issue_id}")]))
    }

    async fn fetch_assigned_issues(&self, user_id: &str) -> Result<Vec<Issue>, LinearError> {
        let mut issues: Vec<Issue> = self
            .issues
            .lock()
            .await
            .values()
            .filter(|i| i.assignee_id.as_deref() == Some(user_id))
            .cloned()
            .collect();
        issues.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        Ok(issues)
    }

    async fn create_comment(&self, issue_id: &str, body: &str) -> Result<bool, LinearError> {
        self.plain_comments
            .lock()
            .await
            .push((issue_id.to_string(), body.to_string()));
        Ok(true)
    }

    async fn create_comment_and_get_id(
        &self,
        issue_id: &str,
        body: &str,
        parent_id: Option<&str>,
    ) -> Result<CommentCreated, LinearError> {
        if self.fail_comments.load(Ordering::SeqCst) {
            return Err(LinearError::Status {
                status: 500,
                body: "comment rejected".into(),
            });
        }
        if self.reject_comments.load(Ordering::SeqCst) {
            return Ok(CommentCreated {
                success: false,
                comment_id: None,
            });
        }
        let id = match self.comment_ids.lock().await.pop_front() {
            Some(id) => id,
            None => self.next_id("comment"),
        };
        self.comments.lock().await.push(PostedComment {
            id: id.clone(),
            issue_id: issue_id.to_string(),
            body: body.to_string(),
            parent_id: parent_id.map(ToString::to_string),
        });
        Ok(CommentCreated {
            success: true,
            comment_id: Some(id),
        })
    }

    async fn resolve_comment_thread(
        &self,
        comment_id: &str,
        resolving_comment_id: Option<&str>,
    ) -> bool {
        self.resolutions.lock().await.push((
            comment_id.to_string(),
            resolving_comment_id.map(ToString::to_string),
        ));
        true
    }

    async fn create_agent_session(&self, _issue_id: &str) -> Result<Option<String>, LinearError> {
        if self.tracker_sessions.load(Ordering::SeqCst) {
            Ok(Some(self.next_id("agent-session")))
        } else {
            Ok(None)
        }
    }

    async fn create_agent_activity(
        &self,
        input: &AgentActivityCreateInput,
    ) -> Result<Option<String>, LinearError> {
        let mut activities = self.activities.lock().await;
        activities.push(input.clone());
        Ok(Some(format!("activity-{}", activities.len())))
    }

    async fn authorization(&self) -> Option<String> {
        Some("Bearer test-token".to_string())
    }
}

/// Provisioner that hands out plain directories under a temp dir.
pub struct FakeProvisioner {
    root: tempfile::TempDir,
    pub ensured: Mutex<Vec<String>>,
}

impl FakeProvisioner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            root: tempfile::tempdir().unwrap(),
            ensured: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl WorkspaceProvisioner for FakeProvisioner {
    async fn ensure(&self, issue: &Issue) -> Result<Workspace, WorkspaceError> {
        self.ensured.lock().await.push(issue.id.clone());
        let path = self.root.path().join(&issue.identifier);
        tokio::fs::create_dir_all(&path).await?;
        Ok(Workspace {
            issue_id: issue.id.clone(),
            history_path: path.join(".history"),
            path,
            is_git_worktree: false,
            branch: issue.branch_name(),
        })
    }

    async fn cleanup(&self, _workspace: &Workspace) -> Result<(), WorkspaceError> {
        Ok(())
    }

    async fn cleanup_all(&self) {}
}

/// One scripted agent turn.
pub enum Turn {
    /// Yield the items, then finish
    Finish(Vec<Result<AgentMessage, RunnerError>>),
    /// Yield the items, then wait until cancelled
    Hang(Vec<Result<AgentMessage, RunnerError>>),
    /// Yield `before`, wait for the gate to open, then yield `after`
    Gated {
        before: Vec<Result<AgentMessage, RunnerError>>,
        gate: Arc<Notify>,
        after: Vec<Result<AgentMessage, RunnerError>>,
    },
}

/// Backend that plays scripted turns and records each request.
#[derive(Default)]
pub struct ScriptedBackend {
    turns: Mutex<VecDeque<Turn>>,
    pub requests: Mutex<Vec<QueryRequest>>,
}

impl ScriptedBackend {
    pub fn new(turns: Vec<Turn>) -> Arc<Self> {
        Arc::new(Self {
            turns: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub async fn requests(&self) -> Vec<QueryRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    async fn query(
        &self,
        request: QueryRequest,
        _cancel: CancellationToken,
    ) -> agent_runner::error::Result<MessageStream> {
        self.requests.lock().await.push(request);
        let turn = self
            .turns
            .lock()
            .await
            .pop_front()
            .unwrap_or(Turn::Finish(Vec::new()));
        Ok(match turn {
            Turn::Finish(items) => stream::iter(items).boxed(),
            Turn::Hang(items) => stream::iter(items).chain(stream::pending()).boxed(),
            Turn::Gated {
                before,
                gate,
                after,
            } => stream::iter(before)
                .chain(
                    stream::once(async move {
                        gate.notified().await;
                        stream::iter(after)
                    })
                    .flatten(),
                )
                .boxed(),
        })
    }
}

pub fn msg(json: serde_json::Value) -> Result<AgentMessage, RunnerError> {
    Ok(serde_json::from_value(json).unwrap())
}

pub fn init(session_id: &str) -> Result<AgentMessage, RunnerError> {
    msg(serde_json::json!({
        "type": "system",
        "subtype": "init",
        "session_id": session_id,
        "model": "test-model",
        "tools": ["Read", "Bash"]
    }))
}

pub fn assistant_text(session_id: &str, text: &str) -> Result<AgentMessage, RunnerError> {
    msg(serde_json::json!({
        "type": "assistant",
        "session_id": session_id,
        "message": { "role": "assistant", "content": [{ "type": "text", "text": text }] }
    }))
}

pub fn success(session_id: &str, text: &str) -> Result<AgentMessage, RunnerError> {
    msg(serde_json::json!({
        "type": "result",
        "subtype": "success",
        "session_id": session_id,
        "result": text,
        "is_error": false,
        "duration_ms": 12_000,
        "total_cost_usd": 0.25
    }))
}

pub fn token_limit(session_id: &str) -> Result<AgentMessage, RunnerError> {
    msg(serde_json::json!({
        "type": "result",
        "subtype": "error_max_tokens",
        "session_id": session_id,
        "result": "Prompt is too long",
        "is_error": true
    }))
}

pub fn issue(id: &str, identifier: &str) -> Issue {
    let mut issue = Issue::new(id, identifier, "Fix the login redirect");
    issue.description = Some("Users land on a blank page after signing in.".into());
    issue.state_type = Some("started".into());
    issue.assignee_id = Some(AGENT_USER.into());
    issue
}

pub struct Harness {
    pub tracker: Arc<FakeTracker>,
    pub provisioner: Arc<FakeProvisioner>,
    pub backend: Arc<ScriptedBackend>,
    pub orchestrator: Orchestrator,
}

impl Harness {
    pub fn new(turns: Vec<Turn>) -> Self {
        Self::with_tracker(FakeTracker::new(), turns)
    }

    pub fn with_tracker(tracker: Arc<FakeTracker>, turns: Vec<Turn>) -> Self {
        Self::build(tracker, turns, |ctx| ctx)
    }

    pub fn build(
        tracker: Arc<FakeTracker>,
        turns: Vec<Turn>,
        customize: impl FnOnce(AppContext) -> AppContext,
    ) -> Self {
        let provisioner = FakeProvisioner::new();
        let backend = ScriptedBackend::new(turns);
        let agent = AgentSettings::new(backend.clone() as Arc<dyn AgentBackend>)
            .with_allowed_tools(vec!["Read".into(), "Bash".into()]);
        let ctx = AppContext::new(
            tracker.clone(),
            provisioner.clone() as Arc<dyn WorkspaceProvisioner>,
            agent,
        )
        .unwrap()
        .with_agent_user_id(AGENT_USER);
        let ctx = customize(ctx);

        Self {
            tracker,
            provisioner,
            backend,
            orchestrator: Orchestrator::new(ctx),
        }
    }
}

/// Poll `check` until it returns true or five seconds pass.
pub async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

