//! Linear API client for the issue agent.
//!
//! This crate provides:
//! - GraphQL client for the Linear API (issues, comments, thread resolution)
//! - A token-refreshing wrapper around the client
//! - Agent Activity types for Linear's agent system
//! - Webhook payload parsing and signature verification

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)] // Every API method can fail on the network

pub mod activities;
pub mod auth;
pub mod client;
pub mod error;
pub mod models;
pub mod webhooks;

pub use activities::{ActivityContent, AgentActivityCreateInput};
pub use auth::{AuthenticatedClient, Credential, CredentialSource};
pub use client::{CommentCreated, LinearClient, DEFAULT_API_URL};
pub use error::LinearError;
pub use models::*;
pub use webhooks::{
    validate_webhook_timestamp, verify_webhook_signature, Notification, NotificationKind,
    WebhookPayload,
};
