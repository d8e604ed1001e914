//! Inbound triggers derived from webhook notifications.

use linear::{Notification, NotificationKind};

/// The comment that caused a trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerComment {
    pub id: String,
    pub body: String,
    pub author_id: Option<String>,
    /// Thread the comment was posted in, if it is a reply
    pub parent_id: Option<String>,
}

impl TriggerComment {
    /// Root of the thread a response to this comment belongs in.
    #[must_use]
    pub fn thread_root(&self) -> &str {
        self.parent_id.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Assignment {
        issue_id: String,
    },
    Mention {
        issue_id: String,
        comment: TriggerComment,
    },
    Reply {
        issue_id: String,
        comment: TriggerComment,
    },
    /// A comment that neither mentions nor replies to the agent
    NewComment {
        issue_id: String,
        comment: TriggerComment,
    },
    Unassignment {
        issue_id: String,
    },
    Ignored {
        kind: NotificationKind,
        reason: &'static str,
    },
}

impl Trigger {
    #[must_use]
    pub fn from_notification(notification: &Notification) -> Self {
        let kind = notification.kind;
        let Some(issue_id) = notification.issue_id().map(ToString::to_string) else {
            return Self::Ignored {
                kind,
                reason: "notification has no issue",
            };
        };

        let comment = comment_of(notification);
        let missing_comment = Self::Ignored {
            kind,
            reason: "notification has no comment",
        };

        match (kind, comment) {
            (NotificationKind::IssueAssignment | NotificationKind::IssueAssignedToYou, _) => {
                Self::Assignment { issue_id }
            }
            (NotificationKind::IssueUnassignedFromYou, _) => Self::Unassignment { issue_id },
            (NotificationKind::IssueCommentMention, Some(comment)) => {
                Self::Mention { issue_id, comment }
            }
            (NotificationKind::IssueCommentReply, Some(comment)) => Self::Reply { issue_id, comment },
            (NotificationKind::IssueNewComment, Some(comment)) => {
                Self::NewComment { issue_id, comment }
            }
            (
                NotificationKind::IssueCommentMention
                | NotificationKind::IssueCommentReply
                | NotificationKind::IssueNewComment,
                None,
            ) => missing_comment,
            (NotificationKind::AgentAssignable, _) => Self::Ignored {
                kind,
                reason: "agent is assignable; nothing to do",
            },
            (NotificationKind::Unknown, _) => Self::Ignored {
                kind,
                reason: "unknown notification type",
            },
        }
    }

    #[must_use]
    pub fn issue_id(&self) -> Option<&str> {
        match self {
            Self::Assignment { issue_id }
            | Self::Unassignment { issue_id }
            | Self::Mention { issue_id, .. }
            | Self::Reply { issue_id, .. }
            | Self::NewComment { issue_id, .. } => Some(issue_id),
            Self::Ignored { .. } => None,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Assignment { .. } => "assignment",
            Self::Mention { .. } => "mention",
            Self::Reply { .. } => "reply",
            Self::NewComment { .. } => "new-comment",
            Self::Unassignment { .. } => "unassignment",
            Self::Ignored { .. } => "ignored",
        }
    }
}

fn comment_of(notification: &Notification) -> Option<TriggerComment> {
    let comment = notification.comment.as_ref()?;
    Some(TriggerComment {
        id: comment.id.clone(),
        body: comment.body.clone(),
        author_id: comment
            .user_id
            .clone()
            .or_else(|| notification.actor_id.clone()),
        parent_id: comment
            .parent_id
            .clone()
            .or_else(|| notification.parent_comment_id.clone()),
    })
}
