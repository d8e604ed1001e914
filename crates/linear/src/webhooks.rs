//! Webhook payload parsing and signature verification.
//!
//! The agent is installed as a Linear app user, so everything it reacts to
//! arrives as an `AppUserNotification` envelope wrapping one notification.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Default tolerance for `webhookTimestamp` drift (60 seconds).
pub const DEFAULT_MAX_WEBHOOK_AGE_MS: i64 = 60_000;

/// Verify a Linear webhook signature (hex HMAC-SHA256 of the raw body).
#[must_use]
pub fn verify_webhook_signature(body: &[u8], signature: &str, secret: &str) -> bool {
    let Ok(signature_bytes) = hex::decode(signature.trim()) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let computed = mac.finalize().into_bytes();

    computed.as_slice().ct_eq(&signature_bytes).into()
}

/// Check that a webhook timestamp (milliseconds) is within `max_age_ms` of now.
#[must_use]
pub fn validate_webhook_timestamp(timestamp_ms: i64, max_age_ms: i64) -> bool {
    let now_ms = chrono::Utc::now().timestamp_millis();
    (now_ms - timestamp_ms).abs() <= max_age_ms
}

/// Notification kinds delivered to app users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NotificationKind {
    IssueAssignment,
    IssueCommentMention,
    IssueCommentReply,
    IssueNewComment,
    AgentAssignable,
    IssueAssignedToYou,
    IssueUnassignedFromYou,
    /// Anything Linear adds later
    #[serde(other)]
    Unknown,
}

/// Envelope of every app-user webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    /// Always `AppUserNotification` for the events handled here
    #[serde(rename = "type")]
    pub event_type: String,
    pub action: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub organization_id: Option<String>,
    #[serde(default)]
    pub oauth_client_id: Option<String>,
    #[serde(default)]
    pub app_user_id: Option<String>,
    /// Milliseconds since epoch, used for replay protection
    #[serde(default)]
    pub webhook_timestamp: Option<i64>,
    #[serde(default)]
    pub webhook_id: Option<String>,
    pub notification: Notification,
}

impl WebhookPayload {
    #[must_use]
    pub fn is_app_user_notification(&self) -> bool {
        self.event_type == "AppUserNotification"
    }
}

/// The notification itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    #[serde(default)]
    pub actor_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub issue_id: Option<String>,
    #[serde(default)]
    pub issue: Option<NotificationIssue>,
    #[serde(default)]
    pub comment_id: Option<String>,
    #[serde(default)]
    pub comment: Option<NotificationComment>,
    #[serde(default)]
    pub parent_comment_id: Option<String>,
    #[serde(default)]
    pub actor: Option<NotificationActor>,
}

impl Notification {
    /// Issue id from either the flat field or the nested issue.
    #[must_use]
    pub fn issue_id(&self) -> Option<&str> {
        self.issue_id
            .as_deref()
            .or_else(|| self.issue.as_ref().map(|i| i.id.as_str()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationTeam {
    pub id: String,
    pub key: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationIssue {
    pub id: String,
    pub title: String,
    pub identifier: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub team_id: Option<String>,
    #[serde(default)]
    pub team: Option<NotificationTeam>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationComment {
    pub id: String,
    pub body: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub issue_id: Option<String>,
    /// Set when the comment is a reply inside a thread
    #[serde(default)]
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationActor {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}
