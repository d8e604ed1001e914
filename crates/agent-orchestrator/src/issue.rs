//! Issue snapshot the orchestrator works from.
//!
//! Fetched from the tracker once per trigger and never mutated locally.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reference to an issue blocking this one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockingIssue {
    pub id: String,
    pub identifier: Option<String>,
}

impl BlockingIssue {
    /// Identifier for display, falling back to the id.
    #[must_use]
    pub fn display(&self) -> &str {
        self.identifier.as_deref().unwrap_or(&self.id)
    }
}

/// A comment on the issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueComment {
    pub id: String,
    pub body: String,
    pub author_id: Option<String>,
    pub author_name: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Thread root when the comment is a reply
    pub parent_id: Option<String>,
}

/// Immutable issue snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    /// Human-readable identifier, e.g. `TEAM-123`
    pub identifier: String,
    pub title: String,
    pub description: Option<String>,
    /// Workflow state name
    pub state: Option<String>,
    /// Workflow state category (`started`, `completed`, ...)
    pub state_type: Option<String>,
    pub priority: Option<f64>,
    pub url: Option<String>,
    pub assignee_id: Option<String>,
    pub branch_name: Option<String>,
    /// Comments in creation order
    pub comments: Vec<IssueComment>,
    pub blocked_by: Vec<BlockingIssue>,
}

impl Issue {
    /// Minimal snapshot, mostly useful for tests and fallbacks.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        identifier: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            identifier: identifier.into(),
            title: title.into(),
            description: None,
            state: None,
            state_type: None,
            priority: None,
            url: None,
            assignee_id: None,
            branch_name: None,
            comments: Vec::new(),
            blocked_by: Vec::new(),
        }
    }

    /// Branch for the issue's workspace: the tracker's suggestion or the lowercased identifier.
    #[must_use]
    pub fn branch_name(&self) -> String {
        self.branch_name
            .as_deref()
            .filter(|b| !b.trim().is_empty())
            .map_or_else(|| self.identifier.to_lowercase(), ToString::to_string)
    }

    #[must_use]
    pub fn is_blocked(&self) -> bool {
        !self.blocked_by.is_empty()
    }

    #[must_use]
    pub fn blocking_identifiers(&self) -> Vec<String> {
        self.blocked_by
            .iter()
            .map(|b| b.display().to_string())
            .collect()
    }

    /// Whether the issue is done or canceled.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state_type.as_deref(),
            Some("completed" | "canceled")
        )
    }

    /// Look up a comment by id.
    #[must_use]
    pub fn comment(&self, comment_id: &str) -> Option<&IssueComment> {
        self.comments.iter().find(|c| c.id == comment_id)
    }
}

impl From<linear::Issue> for Issue {
    fn from(issue: linear::Issue) -> Self {
        let blocked_by = issue
            .blocked_by()
            .into_iter()
            .map(|b| BlockingIssue {
                id: b.id,
                identifier: b.identifier,
            })
            .collect();

        let mut comments: Vec<IssueComment> = issue
            .comments
            .nodes
            .into_iter()
            .map(|c| IssueComment {
                id: c.id,
                body: c.body,
                author_id: c.user.as_ref().map(|u| u.id.clone()),
                author_name: c.user.and_then(|u| u.name),
                created_at: c.created_at,
                parent_id: c.parent.map(|p| p.id),
            })
            .collect();
        comments.sort_by_key(|c| c.created_at);

        let (state, state_type) = match issue.state {
            Some(state) => (Some(state.name), state.state_type),
            None => (None, None),
        };

        Self {
            id: issue.id,
            identifier: issue.identifier,
            title: issue.title,
            description: issue.description,
            state,
            state_type,
            priority: issue.priority,
            url: issue.url,
            assignee_id: issue.assignee.map(|a| a.id),
            branch_name: issue.branch_name,
            comments,
            blocked_by,
        }
    }
}
