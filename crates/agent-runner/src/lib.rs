//! Agent runner: drives one streaming coding-agent conversation.
//!
//! - [`messages`]: the typed JSON-lines messages the agent emits
//! - [`backend`]: the streaming call into the agent (trait + CLI implementation)
//! - [`runner`]: spawn / send input / kill around a backend, with events
//! - [`log`]: the per-session JSONL log

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod backend;
pub mod error;
pub mod log;
pub mod messages;
pub mod runner;

pub use backend::{AgentBackend, ClaudeCliBackend, MessageStream, QueryRequest};
pub use error::RunnerError;
pub use log::SessionLog;
pub use messages::{AgentMessage, ContentBlock, ConversationMessage, ResultMessage, SystemMessage};
pub use runner::{AgentRunner, RunnerConfig, RunnerEvent};
