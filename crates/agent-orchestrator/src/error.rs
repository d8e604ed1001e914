//! Error types for the orchestrator.

use std::string::FromUtf8Error;

use thiserror::Error;

/// Errors raised while provisioning a workspace.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// A git command could not be started
    #[error("git command failed to start ({command}): {source}")]
    GitIo {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// A git command exited non-zero
    #[error("git command returned non-zero exit ({command}) status={status:?}: {stderr}")]
    GitFailed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    /// git printed something that is not UTF-8
    #[error("git command output was not valid UTF-8 ({command}): {source}")]
    NonUtf8Output {
        command: String,
        #[source]
        source: FromUtf8Error,
    },

    /// Filesystem error
    #[error("workspace I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by orchestration.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A second live session was registered for an issue
    #[error("issue {issue_id} already has a live session")]
    SessionAlreadyActive { issue_id: String },

    /// Workspace provisioning failed
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    /// The agent runner rejected a call
    #[error(transparent)]
    Runner(#[from] agent_runner::RunnerError),

    /// The issue tracker failed
    #[error(transparent)]
    Tracker(#[from] linear::LinearError),

    /// Prompt template failed to render
    #[error("failed to render prompt: {0}")]
    Prompt(String),
}
