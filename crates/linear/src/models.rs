//! Linear entity types as returned by the GraphQL API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Relay-style connection wrapper (`{ nodes: [...] }`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection<T> {
    #[serde(default = "Vec::new")]
    pub nodes: Vec<T>,
}

impl<T> Default for Connection<T> {
    fn default() -> Self {
        Self { nodes: Vec::new() }
    }
}

/// A Linear user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

/// Bare `{ id }` reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRef {
    pub id: String,
}

/// Short reference to another issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueRef {
    pub id: String,
    #[serde(default)]
    pub identifier: Option<String>,
}

impl IssueRef {
    /// Human-readable identifier, falling back to the opaque id.
    #[must_use]
    pub fn display_identifier(&self) -> &str {
        self.identifier.as_deref().unwrap_or(&self.id)
    }
}

/// Workflow state of an issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    pub name: String,
    /// `backlog`, `unstarted`, `started`, `completed`, `canceled`, `triage`
    #[serde(rename = "type", default)]
    pub state_type: Option<String>,
}

impl WorkflowState {
    /// Whether work on the issue is finished.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state_type.as_deref(),
            Some("completed" | "canceled")
        )
    }
}

/// A comment on an issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub user: Option<User>,
    /// Root comment of the thread this comment replies in
    #[serde(default)]
    pub parent: Option<IdRef>,
}

/// Relation between two issues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueRelation {
    /// `blocks`, `duplicate`, `related`
    #[serde(rename = "type")]
    pub relation_type: String,
    pub issue: IssueRef,
}

/// A Linear issue with its comments and blocking relations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub id: String,
    pub identifier: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub priority: Option<f64>,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub state: Option<WorkflowState>,
    #[serde(default)]
    pub assignee: Option<User>,
    #[serde(default)]
    pub comments: Connection<Comment>,
    /// Relations where this issue is the related side; `blocks` entries name blockers
    #[serde(default)]
    pub inverse_relations: Connection<IssueRelation>,
}

impl Issue {
    /// Issues blocking this one.
    #[must_use]
    pub fn blocked_by(&self) -> Vec<IssueRef> {
        self.inverse_relations
            .nodes
            .iter()
            .filter(|r| r.relation_type == "blocks")
            .map(|r| r.issue.clone())
            .collect()
    }
}

/// GraphQL fragment shared by issue queries.
pub const ISSUE_FIELDS: &str = r"
    id
    identifier
    title
    description
    url
    priority
    branchName
    state { name type }
    assignee { id name email }
    comments(first: 100) {
        nodes {
            id
            body
            createdAt
            user { id name email }
            parent { id }
        }
    }
    inverseRelations {
        nodes {
            type
            issue { id identifier }
        }
    }
";
