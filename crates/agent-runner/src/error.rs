//! Error types for the agent runner.

use thiserror::Error;

/// Errors raised while driving an agent conversation.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// `spawn` was called on a handle that has already been started
    #[error("Agent runner is already running")]
    AlreadyRunning,

    /// Input was sent to a runner that is not running
    #[error("Agent runner is not running")]
    NotRunning,

    /// The agent process could not be started
    #[error("Failed to spawn agent process '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The agent process exited unsuccessfully
    #[error("Agent process exited with code {}", .code.map_or_else(|| "unknown".to_string(), |c| c.to_string()))]
    ProcessExited {
        code: Option<i32>,
        /// Captured stderr
        stderr: String,
    },

    /// The in-flight turn was aborted by `kill`
    #[error("Agent turn aborted")]
    Aborted,

    /// The agent stream produced something unusable
    #[error("Agent stream error: {0}")]
    Stream(String),

    /// I/O error while talking to the agent process
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    /// Exit code of the agent process, when the error carries one.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::ProcessExited { code, .. } => *code,
            _ => None,
        }
    }

    /// Diagnostic output captured from the agent process.
    #[must_use]
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            Self::ProcessExited { stderr, .. } if !stderr.trim().is_empty() => Some(stderr),
            _ => None,
        }
    }
}

/// Convenience result alias for the runner.
pub type Result<T, E = RunnerError> = std::result::Result<T, E>;
