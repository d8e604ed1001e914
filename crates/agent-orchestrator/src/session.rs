//! Process-level session: one live agent conversation for one issue.

use std::collections::HashMap;
use std::sync::Arc;

use agent_runner::AgentRunner;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::issue::Issue;
use crate::thread::ThreadContext;
use crate::workspace::Workspace;

/// Cap on diagnostic text embedded in a user-facing comment.
pub const MAX_DIAGNOSTIC_CHARS: usize = 1500;

/// Lifecycle of a process-level session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    Spawning,
    Active,
    ExitedClean,
    ExitedError,
}

/// Shared handle stored in the registry.
pub type SessionHandle = Arc<Mutex<Session>>;

/// A comment sent into the running conversation whose turn has not started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedReply {
    /// Thread the answer belongs in
    pub parent_id: String,
    /// Tracker-facing session opened for the comment
    pub agent_session_id: String,
}

/// One live agent conversation tied to an issue and its workspace.
#[derive(Debug)]
pub struct Session {
    pub issue: Issue,
    pub workspace: Workspace,
    /// `None` once the runner has exited
    pub runner: Option<AgentRunner>,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub exit_code: Option<i32>,
    pub exited_at: Option<DateTime<Utc>>,
    /// Accumulated stderr / error output
    pub diagnostics: String,
    pub last_response: Option<String>,
    pub thread: ThreadContext,
    /// Tracker-facing session currently fed by this runner
    pub agent_session_id: Option<String>,
    /// Replies waiting on the runner, keyed by turn number
    pub queued_replies: HashMap<u64, QueuedReply>,
    /// Cost of every finished turn
    pub total_cost_usd: f64,
    /// The runner is being stopped on purpose; its exit is not an error
    pub stop_requested: bool,
}

impl Session {
    #[must_use]
    pub fn new(issue: Issue, workspace: Workspace) -> Self {
        Self {
            issue,
            workspace,
            runner: None,
            state: SessionState::Spawning,
            started_at: Utc::now(),
            exit_code: None,
            exited_at: None,
            diagnostics: String::new(),
            last_response: None,
            thread: ThreadContext::default(),
            agent_session_id: None,
            queued_replies: HashMap::new(),
            total_cost_usd: 0.0,
            stop_requested: false,
        }
    }

    /// Spawning or active.
    #[must_use]
    pub fn is_live(&self) -> bool {
        matches!(self.state, SessionState::Spawning | SessionState::Active)
    }

    pub fn mark_active(&mut self, runner: AgentRunner) {
        self.runner = Some(runner);
        self.state = SessionState::Active;
    }

    /// Record the runner's exit. Exit code 0 is a clean exit.
    pub fn mark_exited(&mut self, exit_code: Option<i32>) {
        self.exit_code = exit_code;
        self.exited_at = Some(Utc::now());
        self.runner = None;
        self.state = if exit_code == Some(0) {
            SessionState::ExitedClean
        } else {
            SessionState::ExitedError
        };
    }

    pub fn append_diagnostics(&mut self, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        if !self.diagnostics.is_empty() {
            self.diagnostics.push('\n');
        }
        self.diagnostics.push_str(text.trim_end());
    }

    /// Stop the runner without reporting its exit as a failure.
    pub fn request_stop(&mut self) {
        self.stop_requested = true;
        self.kill();
    }

    /// Kill the runner, if any. Safe to call repeatedly.
    pub fn kill(&self) {
        if let Some(runner) = &self.runner {
            runner.kill();
        }
    }

    /// User-facing error comment with truncated diagnostics.
    #[must_use]
    pub fn format_error_message(&self) -> String {
        let code = self
            .exit_code
            .map_or_else(|| "unknown".to_string(), |c| c.to_string());
        let mut message = format!(
            "Agent process for issue {} exited unexpectedly with code {code}.",
            self.issue.identifier
        );

        if !self.diagnostics.is_empty() {
            message.push_str("\n\n**Error details:**\n```\n");
            message.push_str(&truncate_diagnostics(&self.diagnostics));
            message.push_str("\n```");
        }
        message
    }
}

/// Cut text to [`MAX_DIAGNOSTIC_CHARS`] characters, marking the cut.
#[must_use]
pub fn truncate_diagnostics(text: &str) -> String {
    match text.char_indices().nth(MAX_DIAGNOSTIC_CHARS) {
        Some((cut, _)) => format!("{} ... (truncated)", &text[..cut]),
        None => text.to_string(),
    }
}

/// Cost footer appended to a final response.
#[must_use]
pub fn format_cost_message(cost_usd: f64, duration_ms: u64, total_cost_usd: Option<f64>) -> String {
    #[allow(clippy::cast_precision_loss)]
    let seconds = duration_ms as f64 / 1000.0;
    let mut message = format!("*Cost for last run: ${cost_usd:.2}, Duration: {seconds}s*");
    if let Some(total) = total_cost_usd {
        message.push_str(&format!("\n*Total estimated cost for this issue: ${total:.2}*"));
    }
    message
}
