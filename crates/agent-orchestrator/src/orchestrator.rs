//! Trigger handling and session lifecycle.
//!
//! The [`Orchestrator`] owns no global state: everything it touches lives in
//! the [`AppContext`] built once at startup. Work on one issue is serialized
//! through the registry's per-issue lock; different issues run concurrently.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agent_runner::{
    AgentBackend, AgentMessage, AgentRunner, ResultMessage, RunnerConfig, RunnerEvent,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use linear::{CommentCreated, WebhookPayload};
use serde::Serialize;
use tokio::sync::{mpsc, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::agent_session::{ActivitySink, AgentSession, AgentSessionManager, AgentSessionStatus};
use crate::attachments::AttachmentDownloader;
use crate::gating::{handle_blocked_issue, KeywordMatcher, PermissionMatcher};
use crate::issue::Issue;
use crate::persistence::StateStore;
use crate::prompt::{escape_xml, PromptBuilder};
use crate::registry::SessionRegistry;
use crate::session::{
    format_cost_message, truncate_diagnostics, QueuedReply, Session, SessionHandle, SessionState,
};
use crate::thread::ThreadContext;
use crate::tracker::IssueTracker;
use crate::trigger::{Trigger, TriggerComment};
use crate::workspace::{Workspace, WorkspaceProvisioner};

/// First comment posted when the agent is assigned.
pub const ACKNOWLEDGEMENT: &str =
    "I've been assigned to this issue and I'm getting started on it.";

/// How runners are built for each session.
#[derive(Clone)]
pub struct AgentSettings {
    pub backend: Arc<dyn AgentBackend>,
    pub allowed_tools: Vec<String>,
    pub max_turns: Option<u32>,
    /// Root of the JSONL session logs; `None` disables them
    pub logs_dir: Option<PathBuf>,
}

impl AgentSettings {
    #[must_use]
    pub fn new(backend: Arc<dyn AgentBackend>) -> Self {
        Self {
            backend,
            allowed_tools: Vec::new(),
            max_turns: None,
            logs_dir: None,
        }
    }

    #[must_use]
    pub fn with_allowed_tools(mut self, tools: Vec<String>) -> Self {
        self.allowed_tools = tools;
        self
    }

    #[must_use]
    pub fn with_max_turns(mut self, max_turns: Option<u32>) -> Self {
        self.max_turns = max_turns;
        self
    }

    #[must_use]
    pub fn with_logs_dir(mut self, logs_dir: impl Into<PathBuf>) -> Self {
        self.logs_dir = Some(logs_dir.into());
        self
    }

    fn runner(
        &self,
        workspace: &Workspace,
        resume_session_id: Option<String>,
    ) -> (AgentRunner, mpsc::UnboundedReceiver<RunnerEvent>) {
        AgentRunner::new(
            Arc::clone(&self.backend),
            RunnerConfig {
                cwd: workspace.path.clone(),
                workspace_name: workspace.name(),
                logs_dir: self.logs_dir.clone(),
                allowed_tools: self.allowed_tools.clone(),
                max_turns: self.max_turns,
                resume_session_id,
            },
        )
    }
}

/// Everything the orchestrator works with, built once at startup.
pub struct AppContext {
    pub tracker: Arc<dyn IssueTracker>,
    pub provisioner: Arc<dyn WorkspaceProvisioner>,
    pub registry: SessionRegistry,
    pub agent_sessions: AgentSessionManager,
    pub prompts: PromptBuilder,
    pub matcher: Box<dyn PermissionMatcher>,
    pub attachments: Option<AttachmentDownloader>,
    pub agent: AgentSettings,
    pub state_store: Option<StateStore>,
    agent_user_id: OnceCell<String>,
}

impl AppContext {
    pub fn new<T: IssueTracker + 'static>(
        tracker: Arc<T>,
        provisioner: Arc<dyn WorkspaceProvisioner>,
        agent: AgentSettings,
    ) -> Result<Self> {
        let sink: Arc<dyn ActivitySink> = Arc::clone(&tracker) as Arc<dyn ActivitySink>;
        Ok(Self {
            tracker,
            provisioner,
            registry: SessionRegistry::new(),
            agent_sessions: AgentSessionManager::new(sink),
            prompts: PromptBuilder::new()?,
            matcher: Box::new(KeywordMatcher::standard()?),
            attachments: None,
            agent,
            state_store: None,
            agent_user_id: OnceCell::new(),
        })
    }

    #[must_use]
    pub fn with_prompts(mut self, prompts: PromptBuilder) -> Self {
        self.prompts = prompts;
        self
    }

    #[must_use]
    pub fn with_matcher(mut self, matcher: impl PermissionMatcher + 'static) -> Self {
        self.matcher = Box::new(matcher);
        self
    }

    #[must_use]
    pub fn with_attachments(mut self, downloader: AttachmentDownloader) -> Self {
        self.attachments = Some(downloader);
        self
    }

    #[must_use]
    pub fn with_state_store(mut self, store: StateStore) -> Self {
        self.state_store = Some(store);
        self
    }

    /// Act as this user instead of asking the tracker who we are.
    #[must_use]
    pub fn with_agent_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.agent_user_id = OnceCell::new_with(Some(user_id.into()));
        self
    }
}

/// Live process session as reported by `/sessions`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub issue_id: String,
    pub identifier: String,
    pub state: SessionState,
    pub workspace: PathBuf,
    pub branch: String,
    pub started_at: DateTime<Utc>,
    pub exited_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub agent_session_id: Option<String>,
    pub total_cost_usd: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub sessions: Vec<SessionSummary>,
    pub agent_sessions: Vec<AgentSession>,
}

enum StartKind {
    Assignment,
    Comment(TriggerComment),
    Startup,
}

#[derive(Clone)]
pub struct Orchestrator {
    ctx: Arc<AppContext>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    #[must_use]
    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    /// The tracker user the agent acts as, resolved once.
    pub async fn agent_user_id(&self) -> Result<String> {
        let tracker = &self.ctx.tracker;
        let id = self
            .ctx
            .agent_user_id
            .get_or_try_init(|| async { tracker.viewer_id().await })
            .await
            .context("resolving the agent's Linear user")?;
        Ok(id.clone())
    }

    /// Entry point for a verified webhook.
    pub async fn handle_webhook(&self, payload: &WebhookPayload) {
        if !payload.is_app_user_notification() {
            debug!(event_type = %payload.event_type, "Ignoring non-notification webhook");
            return;
        }
        let trigger = Trigger::from_notification(&payload.notification);
        if let Err(e) = self.handle_trigger(trigger).await {
            error!(error = %e, "Failed to handle webhook trigger");
        }
    }

    #[instrument(
        skip_all,
        fields(trigger = trigger.name(), issue_id = trigger.issue_id().unwrap_or("-"))
    )]
    pub async fn handle_trigger(&self, trigger: Trigger) -> Result<()> {
        let Some(issue_id) = trigger.issue_id().map(ToString::to_string) else {
            if let Trigger::Ignored { kind, reason } = &trigger {
                debug!(?kind, reason, "Ignoring notification");
            }
            return Ok(());
        };

        let _issue = self.ctx.registry.lock_issue(&issue_id).await;

        match trigger {
            Trigger::Assignment { .. } => {
                self.start_session(&issue_id, StartKind::Assignment).await?;
            }
            Trigger::Mention { comment, .. } | Trigger::Reply { comment, .. } => {
                if self.is_own_comment(&comment).await {
                    return Ok(());
                }
                if self.ctx.registry.has(&issue_id).await {
                    self.continue_session(&issue_id, &comment).await?;
                } else {
                    self.start_session(&issue_id, StartKind::Comment(comment))
                        .await?;
                }
            }
            Trigger::NewComment { comment, .. } => {
                if self.is_own_comment(&comment).await {
                    return Ok(());
                }
                if self.ctx.registry.has(&issue_id).await {
                    self.continue_session(&issue_id, &comment).await?;
                } else {
                    debug!("No live session; ignoring new comment");
                }
            }
            Trigger::Unassignment { .. } => self.stop_session(&issue_id).await,
            Trigger::Ignored { .. } => {}
        }
        Ok(())
    }

    /// Resume work after a restart: reload state and pick up assigned issues.
    pub async fn startup(&self) -> Result<usize> {
        self.restore_state().await;

        let agent_user_id = self.agent_user_id().await?;
        let issues = self
            .ctx
            .tracker
            .fetch_assigned_issues(&agent_user_id)
            .await
            .context("fetching assigned issues")?;

        let mut started = 0;
        for issue in issues.into_iter().filter(|i| !i.is_terminal()) {
            let _issue = self.ctx.registry.lock_issue(&issue.id).await;
            match self.start_session(&issue.id, StartKind::Startup).await {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(issue = %issue.identifier, error = %e, "Could not start assigned issue");
                }
            }
        }
        info!(started, "Startup complete");
        Ok(started)
    }

    /// Stop every live runner and persist agent sessions.
    pub async fn shutdown(&self) {
        let mut stopped = 0;
        for (_, handle) in self.ctx.registry.all().await {
            let mut session = handle.lock().await;
            if session.is_live() {
                session.request_stop();
                stopped += 1;
            }
        }
        info!(stopped, "Stopped live sessions");
        self.persist_state().await;
    }

    /// Drop finished agent sessions older than `retention`.
    pub async fn collect_garbage(&self, retention: chrono::Duration) -> usize {
        let removed = self.ctx.agent_sessions.cleanup(retention).await;
        if removed > 0 {
            self.persist_state().await;
        }
        removed
    }

    /// Run [`Self::collect_garbage`] every `interval` until cancelled.
    pub fn spawn_gc(
        &self,
        interval: Duration,
        retention: chrono::Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        debug!("Garbage collector stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        this.collect_garbage(retention).await;
                    }
                }
            }
        })
    }

    pub async fn status(&self) -> StatusSnapshot {
        let mut sessions = Vec::new();
        for (_, handle) in self.ctx.registry.all().await {
            let s = handle.lock().await;
            sessions.push(SessionSummary {
                issue_id: s.issue.id.clone(),
                identifier: s.issue.identifier.clone(),
                state: s.state,
                workspace: s.workspace.path.clone(),
                branch: s.workspace.branch.clone(),
                started_at: s.started_at,
                exited_at: s.exited_at,
                exit_code: s.exit_code,
                agent_session_id: s.agent_session_id.clone(),
                total_cost_usd: s.total_cost_usd,
            });
        }
        sessions.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        StatusSnapshot {
            sessions,
            agent_sessions: self.ctx.agent_sessions.all().await,
        }
    }

    pub async fn persist_state(&self) {
        let Some(store) = &self.ctx.state_store else {
            return;
        };
        let state = self.ctx.agent_sessions.snapshot().await;
        if let Err(e) = store.save(&state).await {
            warn!(error = %e, "Failed to persist agent session state");
        }
    }

    async fn restore_state(&self) {
        let Some(store) = &self.ctx.state_store else {
            return;
        };
        match store.load().await {
            Ok(Some(state)) => {
                let restored = self.ctx.agent_sessions.restore(state).await;
                info!(restored, path = %store.path().display(), "Restored agent sessions");
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Ignoring unreadable session state"),
        }
    }

    /// Post the final response in the session's thread, then resolve that
    /// thread. Resolution is only attempted after a successful post and only
    /// when a thread is known.
    pub async fn post_final_response_and_resolve(
        &self,
        issue_id: &str,
        body: &str,
        thread: &ThreadContext,
    ) -> bool {
        let target = thread.target();
        let created = match self
            .ctx
            .tracker
            .create_comment_and_get_id(issue_id, body, target)
            .await
        {
            Ok(CommentCreated {
                success: true,
                comment_id,
            }) => comment_id,
            Ok(_) => {
                warn!(issue_id, "Tracker did not accept the final response");
                return false;
            }
            Err(e) => {
                warn!(issue_id, error = %e, "Failed to post the final response");
                return false;
            }
        };

        match target {
            Some(thread_id) => {
                if self
                    .ctx
                    .tracker
                    .resolve_comment_thread(thread_id, created.as_deref())
                    .await
                {
                    info!(issue_id, thread_id, "Resolved comment thread");
                } else {
                    warn!(issue_id, thread_id, "Could not resolve comment thread");
                }
            }
            None => debug!(issue_id, "No thread to resolve"),
        }
        true
    }

    async fn is_own_comment(&self, comment: &TriggerComment) -> bool {
        let Some(author) = comment.author_id.as_deref() else {
            return false;
        };
        match self.agent_user_id().await {
            Ok(agent) => agent == author,
            Err(e) => {
                warn!(error = %e, "Cannot tell whether the comment is the agent's own");
                false
            }
        }
    }

    /// Start a new session. The caller holds the issue lock.
    async fn start_session(&self, issue_id: &str, kind: StartKind) -> Result<bool> {
        let ctx = &self.ctx;
        if ctx.registry.has(issue_id).await {
            debug!(issue_id, "Session already live");
            return Ok(false);
        }

        let issue = ctx
            .tracker
            .fetch_issue(issue_id)
            .await
            .with_context(|| format!("fetching issue {issue_id}"))?;
        let agent_user_id = self.agent_user_id().await?;

        if !handle_blocked_issue(
            ctx.tracker.as_ref(),
            &issue,
            &agent_user_id,
            ctx.matcher.as_ref(),
        )
        .await
        {
            return Ok(false);
        }

        let workspace = match ctx.provisioner.ensure(&issue).await {
            Ok(workspace) => workspace,
            Err(e) => {
                error!(issue = %issue.identifier, error = %e, "Workspace provisioning failed");
                return Ok(false);
            }
        };

        let previous_conversation = self.last_conversation_id(issue_id).await;
        let (prompt, resume) = match (&kind, previous_conversation) {
            (StartKind::Comment(comment), Some(conversation)) => {
                (comment.body.clone(), Some(conversation))
            }
            _ => (self.initial_prompt(&issue, &workspace, &kind).await?, None),
        };

        let thread = match &kind {
            StartKind::Assignment => self.acknowledge(&issue).await,
            StartKind::Comment(comment) => {
                let mut thread = ThreadContext::default();
                thread.reply_within(comment.thread_root());
                thread
            }
            StartKind::Startup => ThreadContext::default(),
        };

        let mut session = Session::new(issue, workspace);
        session.thread = thread;
        let handle = ctx.registry.add(issue_id, session).await?;
        self.launch(handle, prompt, resume).await?;
        Ok(true)
    }

    async fn initial_prompt(
        &self,
        issue: &Issue,
        workspace: &Workspace,
        kind: &StartKind,
    ) -> Result<String> {
        let manifest = match &self.ctx.attachments {
            Some(downloader) => {
                let authorization = self.ctx.tracker.authorization().await;
                let manifest = downloader
                    .download_for_issue(issue, &workspace.path, authorization.as_deref())
                    .await;
                (!manifest.is_empty()).then(|| manifest.render())
            }
            None => None,
        };

        let mut prompt = self
            .ctx
            .prompts
            .build_initial(issue, workspace, manifest.as_deref())?;
        if let StartKind::Comment(comment) = kind {
            let _ = write!(
                prompt,
                "\n<new_comment id=\"{}\">\n{}\n</new_comment>\nRespond to this comment.\n",
                escape_xml(&comment.id),
                escape_xml(&comment.body)
            );
        }
        Ok(prompt)
    }

    async fn acknowledge(&self, issue: &Issue) -> ThreadContext {
        match self
            .ctx
            .tracker
            .create_comment_and_get_id(&issue.id, ACKNOWLEDGEMENT, None)
            .await
        {
            Ok(CommentCreated {
                success: true,
                comment_id: Some(id),
            }) => ThreadContext::with_root(id),
            Ok(_) => {
                warn!(issue = %issue.identifier, "Acknowledgement was not accepted");
                ThreadContext::default()
            }
            Err(e) => {
                warn!(issue = %issue.identifier, error = %e, "Failed to post acknowledgement");
                ThreadContext::default()
            }
        }
    }

    /// Conversation id of the most recent agent session on the issue.
    async fn last_conversation_id(&self, issue_id: &str) -> Option<String> {
        self.ctx
            .agent_sessions
            .sessions_for_issue(issue_id)
            .await
            .into_iter()
            .rev()
            .find_map(|s| s.claude_session_id)
    }

    /// Tracker-driven agent session when the tracker provides one, else local.
    async fn open_agent_session(&self, issue_id: &str) -> String {
        let sessions = &self.ctx.agent_sessions;
        match self.ctx.tracker.create_agent_session(issue_id).await {
            Ok(Some(id)) => {
                sessions.create_tracker_session(&id, issue_id).await;
                id
            }
            Ok(None) => sessions.create_local_session(issue_id).await,
            Err(e) => {
                warn!(issue_id, error = %e, "No tracker agent session; tracking locally");
                sessions.create_local_session(issue_id).await
            }
        }
    }

    async fn launch(
        &self,
        handle: SessionHandle,
        prompt: String,
        resume_session_id: Option<String>,
    ) -> Result<()> {
        let (issue_id, workspace) = {
            let session = handle.lock().await;
            (session.issue.id.clone(), session.workspace.clone())
        };

        let agent_session_id = self.open_agent_session(&issue_id).await;
        let (runner, events) = self.ctx.agent.runner(&workspace, resume_session_id);
        {
            let mut session = handle.lock().await;
            session.agent_session_id = Some(agent_session_id.clone());
            session.mark_active(runner.clone());
        }

        tokio::spawn(self.clone().pump(Arc::clone(&handle), events));

        if let Err(e) = runner.spawn(prompt).await {
            handle.lock().await.mark_exited(None);
            self.close_agent_session(&agent_session_id, true).await;
            self.ctx.registry.remove_if(&issue_id, &handle).await;
            return Err(e).context("spawning agent runner");
        }
        info!(issue_id, workspace = %workspace.path.display(), "Agent session launched");
        Ok(())
    }

    /// Route a comment into the live session. The caller holds the issue lock.
    async fn continue_session(&self, issue_id: &str, comment: &TriggerComment) -> Result<()> {
        let Some(handle) = self.ctx.registry.get(issue_id).await else {
            return Ok(());
        };

        let agent_session_id = self.open_agent_session(issue_id).await;

        // The session stays locked until the reply is queued so the pump
        // cannot see its turn start first.
        let sent = {
            let mut session = handle.lock().await;
            match session.runner.clone() {
                Some(runner) => {
                    let sent = runner.send_input(comment.body.clone()).await;
                    if let Ok(turn) = sent {
                        session.queued_replies.insert(
                            turn,
                            QueuedReply {
                                parent_id: comment.thread_root().to_string(),
                                agent_session_id: agent_session_id.clone(),
                            },
                        );
                    }
                    Some(sent)
                }
                None => None,
            }
        };

        match sent {
            Some(Ok(turn)) => {
                info!(issue_id, comment_id = %comment.id, turn, "Queued comment for live session");
                Ok(())
            }
            Some(Err(e)) => {
                self.close_agent_session(&agent_session_id, false).await;
                Err(e).context("sending comment to the agent")
            }
            None => {
                self.close_agent_session(&agent_session_id, false).await;
                Ok(())
            }
        }
    }

    /// Switch thread and agent session to a reply whose turn just started.
    async fn begin_turn(&self, handle: &SessionHandle, turn: u64) {
        let previous = {
            let mut session = handle.lock().await;
            let Some(reply) = session.queued_replies.remove(&turn) else {
                return;
            };
            session.thread.reply_within(reply.parent_id);
            session.agent_session_id.replace(reply.agent_session_id)
        };
        if let Some(previous) = previous {
            self.close_agent_session(&previous, false).await;
        }
    }

    /// Finish a tracker-facing session; unused local reservations are dropped.
    async fn close_agent_session(&self, id: &str, failed: bool) {
        let sessions = &self.ctx.agent_sessions;
        if sessions.release_reservation(id).await {
            return;
        }
        if failed {
            sessions
                .fail_session(id, "The agent process exited unexpectedly.")
                .await;
        } else {
            sessions.set_status(id, AgentSessionStatus::Complete).await;
        }
    }

    async fn stop_session(&self, issue_id: &str) {
        match self.ctx.registry.remove(issue_id).await {
            Some(handle) => {
                handle.lock().await.request_stop();
                info!(issue_id, "Stopped session; workspace kept");
            }
            None => debug!(issue_id, "No session to stop"),
        }
    }

    /// Consume one runner's events until it ends.
    fn pump(
        self,
        handle: SessionHandle,
        mut events: mpsc::UnboundedReceiver<RunnerEvent>,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let mut token_limited = false;
            let mut restarted = false;
            let mut turn_reported = false;

            while let Some(event) = events.recv().await {
                match event {
                    RunnerEvent::Started => debug!("Agent runner started"),
                    RunnerEvent::TurnStarted { turn } => self.begin_turn(&handle, turn).await,
                    RunnerEvent::Message(message) => {
                        let agent_session_id = handle.lock().await.agent_session_id.clone();
                        if let Some(id) = &agent_session_id {
                            self.ctx.agent_sessions.handle_message(id, &message).await;
                        }
                        if let AgentMessage::Result(result) = &message {
                            if message.is_token_limit() {
                                token_limited = true;
                            } else if !restarted {
                                self.finish_turn(&handle, result).await;
                                turn_reported = true;
                            }
                        }
                    }
                    RunnerEvent::TokenLimit => token_limited = true,
                    RunnerEvent::TurnComplete { .. } => {
                        if token_limited && !restarted {
                            restarted = true;
                            self.restart_after_token_limit(&handle).await;
                        }
                        turn_reported = false;
                    }
                    RunnerEvent::Error {
                        message,
                        diagnostics,
                    } => {
                        handle
                            .lock()
                            .await
                            .append_diagnostics(diagnostics.as_deref().unwrap_or(&message));
                        if token_limited && !restarted {
                            restarted = true;
                            self.restart_after_token_limit(&handle).await;
                        }
                    }
                    RunnerEvent::Ended { exit_code } => {
                        self.session_ended(&handle, exit_code, restarted || turn_reported)
                            .await;
                        return;
                    }
                }
            }
            debug!("Runner event channel closed");
        })
    }

    async fn finish_turn(&self, handle: &SessionHandle, result: &ResultMessage) {
        let (issue_id, identifier, thread, total_cost) = {
            let mut session = handle.lock().await;
            if let Some(cost) = result.total_cost_usd {
                session.total_cost_usd += cost;
            }
            (
                session.issue.id.clone(),
                session.issue.identifier.clone(),
                session.thread.clone(),
                session.total_cost_usd,
            )
        };

        let detail = result.result.as_deref().filter(|r| !r.trim().is_empty());
        let mut body = if result.is_success() {
            detail.unwrap_or("Finished working on this issue.").to_string()
        } else {
            let mut message = format!(
                "The agent run for issue {identifier} ended with an error (`{}`).",
                result.subtype
            );
            if let Some(detail) = detail {
                message.push_str("\n\n**Error details:**\n```\n");
                message.push_str(&truncate_diagnostics(detail));
                message.push_str("\n```");
            }
            message
        };

        if let Some(cost) = result.total_cost_usd {
            let total = (total_cost - cost > f64::EPSILON).then_some(total_cost);
            body.push_str("\n\n");
            body.push_str(&format_cost_message(
                cost,
                result.duration_ms.unwrap_or_default(),
                total,
            ));
        }

        self.post_final_response_and_resolve(&issue_id, &body, &thread)
            .await;

        let mut session = handle.lock().await;
        session.last_response.clone_from(&result.result);
        // A reply routed in while posting keeps its thread
        if session.thread.current_parent_id == thread.current_parent_id {
            session.thread.clear_reply();
        }
    }

    async fn restart_after_token_limit(&self, handle: &SessionHandle) {
        let (issue, workspace, thread) = {
            let mut session = handle.lock().await;
            session.request_stop();
            (
                session.issue.clone(),
                session.workspace.clone(),
                session.thread.clone(),
            )
        };
        info!(issue = %issue.identifier, "Token limit reached; starting a fresh session");

        let _issue = self.ctx.registry.lock_issue(&issue.id).await;
        match self.ctx.registry.get(&issue.id).await {
            Some(current) if Arc::ptr_eq(&current, handle) => {}
            _ => {
                debug!(issue = %issue.identifier, "Session was replaced or removed; not restarting");
                return;
            }
        }

        let prompt = match self.ctx.prompts.build_resume(&issue, &workspace) {
            Ok(prompt) => prompt,
            Err(e) => {
                error!(issue = %issue.identifier, error = %e, "Cannot build resume prompt");
                return;
            }
        };

        let mut session = Session::new(issue.clone(), workspace);
        session.thread = thread;
        let fresh = self.ctx.registry.replace(&issue.id, session).await;
        if let Err(e) = self.launch(fresh, prompt, None).await {
            error!(issue = %issue.identifier, error = %e, "Restart after token limit failed");
        }
    }

    async fn session_ended(
        &self,
        handle: &SessionHandle,
        exit_code: Option<i32>,
        already_reported: bool,
    ) {
        let (issue_id, stop_requested, error_message, thread, agent_session_ids) = {
            let mut session = handle.lock().await;
            session.mark_exited(exit_code);
            let failed = session.state == SessionState::ExitedError;
            let mut ids: Vec<String> = session.agent_session_id.iter().cloned().collect();
            let mut queued: Vec<_> = session.queued_replies.drain().collect();
            queued.sort_by_key(|(turn, _)| *turn);
            ids.extend(queued.into_iter().map(|(_, reply)| reply.agent_session_id));
            (
                session.issue.id.clone(),
                session.stop_requested,
                failed.then(|| session.format_error_message()),
                session.thread.clone(),
                ids,
            )
        };

        let failed = error_message.is_some() && !stop_requested;
        for id in &agent_session_ids {
            self.close_agent_session(id, failed).await;
        }

        if failed && !already_reported {
            if let Some(message) = error_message {
                self.post_comment(&issue_id, &message, thread.target()).await;
            }
        }

        if self.ctx.registry.remove_if(&issue_id, handle).await {
            info!(issue_id, exit_code = ?exit_code, "Session released");
        }
    }

    async fn post_comment(&self, issue_id: &str, body: &str, parent_id: Option<&str>) {
        match self
            .ctx
            .tracker
            .create_comment_and_get_id(issue_id, body, parent_id)
            .await
        {
            Ok(created) if created.success => debug!(issue_id, "Posted comment"),
            Ok(_) => warn!(issue_id, "Tracker did not accept the comment"),
            Err(e) => warn!(issue_id, error = %e, "Failed to post comment"),
        }
    }
}

