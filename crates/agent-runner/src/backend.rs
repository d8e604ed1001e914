//! The streaming call into the coding agent.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, RunnerError};
use crate::messages::AgentMessage;

/// Stream of messages produced by one turn.
pub type MessageStream = BoxStream<'static, Result<AgentMessage>>;

/// Parameters for one agent turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryRequest {
    pub prompt: String,
    pub cwd: PathBuf,
    pub allowed_tools: Vec<String>,
    pub max_turns: Option<u32>,
    /// Continue an earlier conversation instead of starting a new one
    pub resume_session_id: Option<String>,
}

/// A coding agent that answers a prompt with a stream of messages.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Start one turn. The stream ends when the turn is complete and
    /// yields [`RunnerError::Aborted`] once `cancel` fires.
    async fn query(&self, request: QueryRequest, cancel: CancellationToken) -> Result<MessageStream>;
}

/// Runs the agent CLI in non-interactive JSON-lines mode.
#[derive(Debug, Clone)]
pub struct ClaudeCliBackend {
    executable: String,
    model: Option<String>,
    extra_args: Vec<String>,
}

impl Default for ClaudeCliBackend {
    fn default() -> Self {
        Self::new("claude")
    }
}

impl ClaudeCliBackend {
    #[must_use]
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            model: None,
            extra_args: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    #[must_use]
    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    /// Command-line arguments for one turn.
    #[must_use]
    pub fn build_args(&self, request: &QueryRequest) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];

        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if !request.allowed_tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(request.allowed_tools.join(","));
        }
        if let Some(max_turns) = request.max_turns {
            args.push("--max-turns".to_string());
            args.push(max_turns.to_string());
        }
        if let Some(session_id) = &request.resume_session_id {
            args.push("--resume".to_string());
            args.push(session_id.clone());
        }
        args.extend(self.extra_args.iter().cloned());

        // Keep a prompt starting with `-` from being parsed as a flag
        args.push("--".to_string());
        args.push(request.prompt.clone());
        args
    }
}

struct CliStream {
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
    stderr: Option<JoinHandle<String>>,
    cancel: CancellationToken,
    done: bool,
}

impl CliStream {
    async fn collect_stderr(&mut self) -> String {
        match self.stderr.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        }
    }

    async fn next_message(&mut self) -> Option<Result<AgentMessage>> {
        loop {
            if self.done {
                return None;
            }

            let line = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    self.done = true;
                    if let Err(e) = self.child.start_kill() {
                        debug!(error = %e, "Agent process already gone");
                    }
                    return Some(Err(RunnerError::Aborted));
                }
                line = self.lines.next_line() => line,
            };

            match line {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<AgentMessage>(trimmed) {
                        Ok(message) => return Some(Ok(message)),
                        Err(e) => {
                            debug!(error = %e, line = %trimmed, "Skipping unparseable agent output");
                        }
                    }
                }
                Ok(None) => {
                    self.done = true;
                    let status = self.child.wait().await;
                    let stderr = self.collect_stderr().await;
                    return match status {
                        Ok(status) if status.success() => None,
                        Ok(status) => {
                            warn!(exit_code = ?status.code(), "Agent process failed");
                            Some(Err(RunnerError::ProcessExited {
                                code: status.code(),
                                stderr,
                            }))
                        }
                        Err(e) => Some(Err(e.into())),
                    };
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            }
        }
    }
}

#[async_trait]
impl AgentBackend for ClaudeCliBackend {
    async fn query(&self, request: QueryRequest, cancel: CancellationToken) -> Result<MessageStream> {
        let args = self.build_args(&request);
        debug!(
            cli = %self.executable,
            cwd = %request.cwd.display(),
            args_count = args.len(),
            resume = request.resume_session_id.is_some(),
            "Starting agent turn"
        );

        let mut child = Command::new(&self.executable)
            .args(&args)
            .current_dir(&request.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunnerError::Spawn {
                program: self.executable.clone(),
                source,
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunnerError::Stream("Failed to capture stdout".to_string()))?;
        let stderr = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                if let Err(e) = stderr.read_to_string(&mut buf).await {
                    debug!(error = %e, "Failed to read agent stderr");
                }
                buf
            })
        });

        let state = CliStream {
            child,
            lines: BufReader::new(stdout).lines(),
            stderr,
            cancel,
            done: false,
        };

        Ok(stream::unfold(state, |mut state| async move {
            let item = state.next_message().await?;
            Some((item, state))
        })
        .boxed())
    }
}
