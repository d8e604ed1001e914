//! One long-running agent conversation.
//!
//! An [`AgentRunner`] is spawned once with the initial prompt and then fed
//! follow-up input turn by turn. Turns run one at a time in the order they
//! were submitted; each is announced with [`RunnerEvent::TurnStarted`] and
//! every message is forwarded on the event channel as soon as it arrives.
//! `kill` aborts the in-flight turn at its next suspension point and drops
//! any queued ones.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{AgentBackend, QueryRequest};
use crate::error::{Result, RunnerError};
use crate::log::SessionLog;
use crate::messages::AgentMessage;

/// Static configuration of a runner.
#[derive(Debug, Clone, Default)]
pub struct RunnerConfig {
    /// Working directory handed to the agent
    pub cwd: PathBuf,
    /// Name of the per-workspace log directory
    pub workspace_name: String,
    /// Root of the JSONL logs; `None` disables logging
    pub logs_dir: Option<PathBuf>,
    pub allowed_tools: Vec<String>,
    pub max_turns: Option<u32>,
    /// Conversation to resume on the first turn
    pub resume_session_id: Option<String>,
}

/// Lifecycle and message events emitted by a runner.
#[derive(Debug, Clone, PartialEq)]
pub enum RunnerEvent {
    Started,
    /// A submitted turn left the queue; `turn` is the number returned by
    /// `spawn` (always 0) or `send_input`
    TurnStarted { turn: u64 },
    Message(AgentMessage),
    /// The conversation ran out of context
    TokenLimit,
    /// The stream for one turn was exhausted
    TurnComplete { session_id: Option<String> },
    Error { message: String, diagnostics: Option<String> },
    /// The runner stopped; no further events follow
    Ended { exit_code: Option<i32> },
}

struct Turn {
    number: u64,
    prompt: String,
}

struct Inner {
    backend: Arc<dyn AgentBackend>,
    config: RunnerConfig,
    events: mpsc::UnboundedSender<RunnerEvent>,
    cancel: CancellationToken,
    spawned: AtomicBool,
    running: AtomicBool,
    ended: AtomicBool,
    next_turn: AtomicU64,
    turns: OnceLock<mpsc::UnboundedSender<Turn>>,
    session_id: Mutex<Option<String>>,
    log: Mutex<Option<SessionLog>>,
}

/// Handle to one agent conversation.
#[derive(Clone)]
pub struct AgentRunner {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for AgentRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRunner")
            .field("workspace", &self.inner.config.workspace_name)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl AgentRunner {
    /// Create a runner and the receiver for its events.
    #[must_use]
    pub fn new(
        backend: Arc<dyn AgentBackend>,
        config: RunnerConfig,
    ) -> (Self, mpsc::UnboundedReceiver<RunnerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let session_id = config.resume_session_id.clone();
        let inner = Inner {
            backend,
            config,
            events,
            cancel: CancellationToken::new(),
            spawned: AtomicBool::new(false),
            running: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            next_turn: AtomicU64::new(0),
            turns: OnceLock::new(),
            session_id: Mutex::new(session_id),
            log: Mutex::new(None),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    /// Start the conversation with its initial prompt, which runs as turn 0.
    ///
    /// A handle can be spawned exactly once.
    pub async fn spawn(&self, prompt: impl Into<String>) -> Result<()> {
        if self.inner.spawned.swap(true, Ordering::SeqCst) {
            return Err(RunnerError::AlreadyRunning);
        }
        self.inner.running.store(true, Ordering::SeqCst);

        if let Some(logs_dir) = &self.inner.config.logs_dir {
            let log = SessionLog::create(
                logs_dir,
                &self.inner.config.workspace_name,
                &self.inner.config.cwd,
            )
            .await;
            *self.inner.log.lock().await = Some(log);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if self.inner.turns.set(tx).is_err() {
            return Err(RunnerError::AlreadyRunning);
        }

        info!(workspace = %self.inner.config.workspace_name, "Agent runner started");
        self.inner.emit(RunnerEvent::Started);
        self.inner.submit(prompt.into())?;
        tokio::spawn(Arc::clone(&self.inner).run(rx));
        Ok(())
    }

    /// Queue a follow-up turn behind any in-flight one. Returns the turn's
    /// number, as later reported by [`RunnerEvent::TurnStarted`].
    pub async fn send_input(&self, text: impl Into<String>) -> Result<u64> {
        if !self.is_running() {
            return Err(RunnerError::NotRunning);
        }
        self.inner.submit(text.into())
    }

    /// Abort any in-flight turn and stop the runner. Safe to call repeatedly.
    pub fn kill(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(workspace = %self.inner.config.workspace_name, "Killing agent runner");
        self.inner.cancel.cancel();
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Conversation id, once the agent has reported it.
    pub async fn session_id(&self) -> Option<String> {
        self.inner.session_id.lock().await.clone()
    }
}

impl Inner {
    fn emit(&self, event: RunnerEvent) {
        if self.events.send(event).is_err() {
            debug!("Runner event receiver dropped");
        }
    }

    fn submit(&self, prompt: String) -> Result<u64> {
        let turns = self.turns.get().ok_or(RunnerError::NotRunning)?;
        let number = self.next_turn.fetch_add(1, Ordering::SeqCst);
        turns
            .send(Turn { number, prompt })
            .map_err(|_| RunnerError::NotRunning)?;
        Ok(number)
    }

    /// Turn worker: runs queued turns in order until killed or a turn fails.
    async fn run(self: Arc<Self>, mut turns: mpsc::UnboundedReceiver<Turn>) {
        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => None,
                turn = turns.recv() => turn,
            };
            let Some(turn) = next else {
                break;
            };
            if !self.run_turn(turn).await {
                return;
            }
        }
        self.end(Some(0)).await;
    }

    /// Run one turn. Returns `false` once the runner has ended.
    async fn run_turn(&self, turn: Turn) -> bool {
        self.emit(RunnerEvent::TurnStarted { turn: turn.number });

        let request = QueryRequest {
            prompt: turn.prompt,
            cwd: self.config.cwd.clone(),
            allowed_tools: self.config.allowed_tools.clone(),
            max_turns: self.config.max_turns,
            resume_session_id: self.session_id.lock().await.clone(),
        };

        match self.stream_turn(request).await {
            Ok(()) => {
                let session_id = self.session_id.lock().await.clone();
                debug!(session_id = ?session_id, turn = turn.number, "Agent turn complete");
                self.emit(RunnerEvent::TurnComplete { session_id });
                true
            }
            Err(e) => {
                self.fail(e).await;
                false
            }
        }
    }

    async fn stream_turn(&self, request: QueryRequest) -> Result<()> {
        let mut stream = self
            .backend
            .query(request, self.cancel.child_token())
            .await?;

        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(RunnerError::Aborted),
                next = stream.next() => next,
            };

            let Some(item) = next else {
                return Ok(());
            };
            let message = item?;

            if let Some(id) = message.session_id() {
                let mut current = self.session_id.lock().await;
                if current.as_deref() != Some(id) {
                    debug!(session_id = %id, "Captured agent session id");
                    *current = Some(id.to_string());
                }
            }
            if let Some(log) = self.log.lock().await.as_mut() {
                log.append(&message).await;
            }

            let token_limit = message.is_token_limit();
            self.emit(RunnerEvent::Message(message));
            if token_limit {
                warn!(workspace = %self.config.workspace_name, "Agent hit token limit");
                self.emit(RunnerEvent::TokenLimit);
            }
        }
    }

    async fn fail(&self, error: RunnerError) {
        self.running.store(false, Ordering::SeqCst);
        if matches!(error, RunnerError::Aborted) {
            info!(workspace = %self.config.workspace_name, "Agent turn aborted");
        } else {
            warn!(workspace = %self.config.workspace_name, error = %error, "Agent turn failed");
        }
        self.emit(RunnerEvent::Error {
            message: error.to_string(),
            diagnostics: error.diagnostics().map(ToString::to_string),
        });
        self.end(Some(error.exit_code().unwrap_or(1))).await;
    }

    async fn end(&self, exit_code: Option<i32>) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        self.running.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        if let Some(mut log) = self.log.lock().await.take() {
            log.close().await;
        }
        self.emit(RunnerEvent::Ended { exit_code });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MessageStream;
    use async_trait::async_trait;
    use futures::stream;
    use std::time::Duration;

    struct ScriptedBackend {
        turns: Mutex<Vec<Vec<Result<AgentMessage>>>>,
        requests: Mutex<Vec<QueryRequest>>,
    }

    impl ScriptedBackend {
        fn new(turns: Vec<Vec<Result<AgentMessage>>>) -> Arc<Self> {
            Arc::new(Self {
                turns: Mutex::new(turns),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl AgentBackend for ScriptedBackend {
        async fn query(
            &self,
            request: QueryRequest,
            _cancel: CancellationToken,
        ) -> Result<MessageStream> {
            self.requests.lock().await.push(request);
            let mut turns = self.turns.lock().await;
            let turn = if turns.is_empty() {
                Vec::new()
            } else {
                turns.remove(0)
            };
            Ok(stream::iter(turn).boxed())
        }
    }

    struct HangingBackend;

    #[async_trait]
    impl AgentBackend for HangingBackend {
        async fn query(
            &self,
            _request: QueryRequest,
            _cancel: CancellationToken,
        ) -> Result<MessageStream> {
            let first: AgentMessage = serde_json::from_str(
                r#"{"type":"system","subtype":"init","session_id":"hang-1"}"#,
            )
            .unwrap();
            Ok(stream::iter(vec![Ok(first)])
                .chain(stream::pending())
                .boxed())
        }
    }

    fn msg(json: &str) -> Result<AgentMessage> {
        Ok(serde_json::from_str(json).unwrap())
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<RunnerEvent>) -> RunnerEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for runner event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_spawn_twice_fails() {
        let backend = ScriptedBackend::new(vec![]);
        let (runner, _rx) = AgentRunner::new(backend, RunnerConfig::default());
        runner.spawn("hello").await.unwrap();
        let err = runner.spawn("again").await.unwrap_err();
        assert!(matches!(err, RunnerError::AlreadyRunning));
        assert_eq!(err.to_string(), "Agent runner is already running");
    }

    #[tokio::test]
    async fn test_send_input_requires_running() {
        let backend = ScriptedBackend::new(vec![]);
        let (runner, _rx) = AgentRunner::new(backend, RunnerConfig::default());
        let err = runner.send_input("hi").await.unwrap_err();
        assert!(matches!(err, RunnerError::NotRunning));
    }

    #[tokio::test]
    async fn test_turns_stream_messages_and_resume_conversation() {
        let backend = ScriptedBackend::new(vec![
            vec![
                msg(r#"{"type":"system","subtype":"init","session_id":"conv-1"}"#),
                msg(r#"{"type":"result","subtype":"success","session_id":"conv-1","result":"done"}"#),
            ],
            vec![msg(
                r#"{"type":"result","subtype":"success","session_id":"conv-1","result":"again"}"#,
            )],
        ]);
        let (runner, mut rx) = AgentRunner::new(backend.clone(), RunnerConfig::default());

        runner.spawn("first").await.unwrap();
        assert_eq!(next_event(&mut rx).await, RunnerEvent::Started);
        assert_eq!(next_event(&mut rx).await, RunnerEvent::TurnStarted { turn: 0 });
        assert!(matches!(next_event(&mut rx).await, RunnerEvent::Message(AgentMessage::System(_))));
        assert!(matches!(next_event(&mut rx).await, RunnerEvent::Message(AgentMessage::Result(_))));
        assert_eq!(
            next_event(&mut rx).await,
            RunnerEvent::TurnComplete {
                session_id: Some("conv-1".into())
            }
        );
        assert!(runner.is_running());

        assert_eq!(runner.send_input("second").await.unwrap(), 1);
        assert_eq!(next_event(&mut rx).await, RunnerEvent::TurnStarted { turn: 1 });
        assert!(matches!(next_event(&mut rx).await, RunnerEvent::Message(_)));
        assert!(matches!(next_event(&mut rx).await, RunnerEvent::TurnComplete { .. }));

        let requests = backend.requests.lock().await;
        assert_eq!(requests[0].resume_session_id, None);
        assert_eq!(requests[1].prompt, "second");
        assert_eq!(requests[1].resume_session_id.as_deref(), Some("conv-1"));
    }

    #[tokio::test]
    async fn test_token_limit_is_surfaced() {
        let backend = ScriptedBackend::new(vec![vec![msg(
            r#"{"type":"result","subtype":"error_max_tokens","is_error":true}"#,
        )]]);
        let (runner, mut rx) = AgentRunner::new(backend, RunnerConfig::default());
        runner.spawn("big").await.unwrap();

        assert_eq!(next_event(&mut rx).await, RunnerEvent::Started);
        assert_eq!(next_event(&mut rx).await, RunnerEvent::TurnStarted { turn: 0 });
        assert!(matches!(next_event(&mut rx).await, RunnerEvent::Message(_)));
        assert_eq!(next_event(&mut rx).await, RunnerEvent::TokenLimit);
    }

    #[tokio::test]
    async fn test_stream_error_ends_runner() {
        let backend = ScriptedBackend::new(vec![vec![Err(RunnerError::ProcessExited {
            code: Some(2),
            stderr: "fatal: bad".into(),
        })]]);
        let (runner, mut rx) = AgentRunner::new(backend, RunnerConfig::default());
        runner.spawn("go").await.unwrap();

        assert_eq!(next_event(&mut rx).await, RunnerEvent::Started);
        assert_eq!(next_event(&mut rx).await, RunnerEvent::TurnStarted { turn: 0 });
        match next_event(&mut rx).await {
            RunnerEvent::Error { diagnostics, .. } => {
                assert_eq!(diagnostics.as_deref(), Some("fatal: bad"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(
            next_event(&mut rx).await,
            RunnerEvent::Ended { exit_code: Some(2) }
        );
        assert!(!runner.is_running());
    }

    #[tokio::test]
    async fn test_kill_aborts_in_flight_turn() {
        let (runner, mut rx) = AgentRunner::new(Arc::new(HangingBackend), RunnerConfig::default());
        runner.spawn("work").await.unwrap();
        assert_eq!(next_event(&mut rx).await, RunnerEvent::Started);
        assert_eq!(next_event(&mut rx).await, RunnerEvent::TurnStarted { turn: 0 });
        assert!(matches!(next_event(&mut rx).await, RunnerEvent::Message(_)));

        runner.kill();
        runner.kill();
        assert!(!runner.is_running());

        match next_event(&mut rx).await {
            RunnerEvent::Error { message, .. } => assert_eq!(message, "Agent turn aborted"),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(next_event(&mut rx).await, RunnerEvent::Ended { .. }));
        assert!(matches!(
            runner.send_input("more").await,
            Err(RunnerError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_queued_turns_run_in_order() {
        let backend = ScriptedBackend::new(vec![
            vec![msg(r#"{"type":"assistant","session_id":"conv-1","message":{"content":[{"type":"text","text":"one"}]}}"#)],
            vec![msg(r#"{"type":"assistant","session_id":"conv-1","message":{"content":[{"type":"text","text":"two"}]}}"#)],
            vec![],
        ]);
        let (runner, mut rx) = AgentRunner::new(backend.clone(), RunnerConfig::default());
        runner.spawn("first").await.unwrap();
        assert_eq!(runner.send_input("second").await.unwrap(), 1);
        assert_eq!(runner.send_input("third").await.unwrap(), 2);

        let mut started = Vec::new();
        let mut completed = 0;
        while completed < 3 {
            match next_event(&mut rx).await {
                RunnerEvent::TurnStarted { turn } => started.push(turn),
                RunnerEvent::TurnComplete { .. } => completed += 1,
                _ => {}
            }
        }
        assert_eq!(started, vec![0, 1, 2]);

        let prompts: Vec<_> = backend
            .requests
            .lock()
            .await
            .iter()
            .map(|r| r.prompt.clone())
            .collect();
        assert_eq!(prompts, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_kill_drops_queued_turns() {
        let (runner, mut rx) = AgentRunner::new(Arc::new(HangingBackend), RunnerConfig::default());
        runner.spawn("work").await.unwrap();
        runner.send_input("queued").await.unwrap();
        assert_eq!(next_event(&mut rx).await, RunnerEvent::Started);
        assert_eq!(next_event(&mut rx).await, RunnerEvent::TurnStarted { turn: 0 });
        assert!(matches!(next_event(&mut rx).await, RunnerEvent::Message(_)));

        runner.kill();
        assert!(matches!(next_event(&mut rx).await, RunnerEvent::Error { .. }));
        assert!(matches!(next_event(&mut rx).await, RunnerEvent::Ended { .. }));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_kill_idle_runner_ends_cleanly() {
        let backend = ScriptedBackend::new(vec![vec![]]);
        let (runner, mut rx) = AgentRunner::new(backend, RunnerConfig::default());
        runner.spawn("quick").await.unwrap();
        assert_eq!(next_event(&mut rx).await, RunnerEvent::Started);
        assert_eq!(next_event(&mut rx).await, RunnerEvent::TurnStarted { turn: 0 });
        assert!(matches!(next_event(&mut rx).await, RunnerEvent::TurnComplete { .. }));

        runner.kill();
        assert_eq!(
            next_event(&mut rx).await,
            RunnerEvent::Ended { exit_code: Some(0) }
        );
    }

    #[tokio::test]
    async fn test_messages_are_logged() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ScriptedBackend::new(vec![vec![msg(
            r#"{"type":"system","subtype":"init","session_id":"logged-1"}"#,
        )]]);
        let config = RunnerConfig {
            cwd: dir.path().to_path_buf(),
            workspace_name: "ENG-9".into(),
            logs_dir: Some(dir.path().join("logs")),
            ..RunnerConfig::default()
        };
        let (runner, mut rx) = AgentRunner::new(backend, config);
        runner.spawn("go").await.unwrap();
        while !matches!(next_event(&mut rx).await, RunnerEvent::TurnComplete { .. }) {}

        runner.kill();
        assert!(matches!(next_event(&mut rx).await, RunnerEvent::Ended { .. }));

        let mut entries = tokio::fs::read_dir(dir.path().join("logs/ENG-9")).await.unwrap();
        let entry = entries.next_entry().await.unwrap().unwrap();
        assert!(entry
            .file_name()
            .to_string_lossy()
            .starts_with("session-logged-1-"));
    }
}
