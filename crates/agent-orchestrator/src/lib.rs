//! Runs a coding agent as the assignee of Linear issues.
//!
//! A webhook (assignment, mention, reply) becomes a [`trigger::Trigger`]. The
//! [`orchestrator::Orchestrator`] provisions a per-issue [`workspace`], spawns
//! an agent runner, and translates its streamed messages into Linear agent
//! activities through the [`agent_session`] translator. Final responses land
//! in the comment thread that started the work, which is then resolved.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod agent_session;
pub mod attachments;
pub mod config;
pub mod error;
pub mod gating;
pub mod issue;
pub mod orchestrator;
pub mod persistence;
pub mod prompt;
pub mod registry;
pub mod server;
pub mod session;
pub mod thread;
pub mod tracker;
pub mod trigger;
pub mod workspace;

pub use agent_session::{
    ActivitySink, AgentSession, AgentSessionEntry, AgentSessionManager, AgentSessionStatus,
};
pub use config::Config;
pub use error::{OrchestratorError, WorkspaceError};
pub use gating::{KeywordMatcher, PermissionMatcher};
pub use issue::{Issue, IssueComment};
pub use orchestrator::{AgentSettings, AppContext, Orchestrator};
pub use registry::SessionRegistry;
pub use session::{Session, SessionState};
pub use thread::ThreadContext;
pub use tracker::IssueTracker;
pub use trigger::Trigger;
pub use workspace::{GitWorktreeProvisioner, Workspace, WorkspaceProvisioner};
