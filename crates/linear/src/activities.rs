//! Agent activities: what the agent shows on an issue's agent session.
//!
//! Every entry the agent produces while working on an issue is mirrored to
//! Linear as one activity.

use serde::{Deserialize, Serialize};

/// Activity body, tagged by `type` the way the API expects it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ActivityContent {
    /// Reasoning or a system note
    Thought { body: String },
    /// One tool call
    Action {
        /// Tool name, e.g. `Bash`
        action: String,
        /// Tool input as JSON text
        parameter: String,
    },
    /// The turn's final answer
    Response { body: String },
    Error { body: String },
}

impl ActivityContent {
    #[must_use]
    pub fn thought(body: impl Into<String>) -> Self {
        Self::Thought { body: body.into() }
    }

    #[must_use]
    pub fn action(tool: impl Into<String>, input: impl Into<String>) -> Self {
        Self::Action {
            action: tool.into(),
            parameter: input.into(),
        }
    }

    #[must_use]
    pub fn response(body: impl Into<String>) -> Self {
        Self::Response { body: body.into() }
    }

    #[must_use]
    pub fn error(body: impl Into<String>) -> Self {
        Self::Error { body: body.into() }
    }

    /// Name of the variant as it appears on the wire.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Thought { .. } => "thought",
            Self::Action { .. } => "action",
            Self::Response { .. } => "response",
            Self::Error { .. } => "error",
        }
    }
}

/// `AgentActivityCreateInput` GraphQL input.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentActivityCreateInput {
    pub agent_session_id: String,
    pub content: ActivityContent,
}

impl AgentActivityCreateInput {
    #[must_use]
    pub fn new(agent_session_id: impl Into<String>, content: ActivityContent) -> Self {
        Self {
            agent_session_id: agent_session_id.into(),
            content,
        }
    }
}

pub const AGENT_ACTIVITY_CREATE_MUTATION: &str = r"
mutation AgentActivityCreate($input: AgentActivityCreateInput!) {
    agentActivityCreate(input: $input) {
        success
        agentActivity { id }
    }
}
";

/// Result of `agentActivityCreate`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentActivityCreatePayload {
    pub success: bool,
    #[serde(default)]
    pub agent_activity: Option<CreatedAgentActivity>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatedAgentActivity {
    pub id: String,
}
