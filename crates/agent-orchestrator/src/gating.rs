//! Blocked-issue gate.
//!
//! An issue with blocking relations is only worked on when someone other
//! than the agent answered the agent's latest "this is blocked" comment
//! with an affirmative reply.

use regex::Regex;
use tracing::{info, warn};

use crate::issue::Issue;
use crate::tracker::IssueTracker;

/// Decides which comments ask for and which grant permission.
pub trait PermissionMatcher: Send + Sync {
    /// Whether an agent comment asks if it should proceed despite a block.
    fn is_blocked_query(&self, body: &str) -> bool;

    /// Whether a reply grants permission to proceed.
    fn grants_permission(&self, body: &str) -> bool;
}

/// Case-insensitive keyword matching.
#[derive(Debug, Clone)]
pub struct KeywordMatcher {
    query: Regex,
    affirmative: Regex,
}

pub const DEFAULT_PERMISSION_KEYWORDS: &[&str] =
    &["proceed", "go ahead", "yes", "continue anyway", "approved"];

impl KeywordMatcher {
    /// Build a matcher from affirmative keywords.
    pub fn new(keywords: &[&str]) -> Result<Self, regex::Error> {
        let alternatives = keywords
            .iter()
            .map(|k| regex::escape(k.trim()).replace(' ', r"\s+"))
            .collect::<Vec<_>>()
            .join("|");
        Ok(Self {
            query: Regex::new(r"(?i)\bblocked\b")?,
            affirmative: Regex::new(&format!(r"(?i)\b(?:{alternatives})\b"))?,
        })
    }

    /// Matcher over [`DEFAULT_PERMISSION_KEYWORDS`].
    pub fn standard() -> Result<Self, regex::Error> {
        Self::new(DEFAULT_PERMISSION_KEYWORDS)
    }
}

impl PermissionMatcher for KeywordMatcher {
    fn is_blocked_query(&self, body: &str) -> bool {
        self.query.is_match(body)
    }

    fn grants_permission(&self, body: &str) -> bool {
        self.affirmative.is_match(body)
    }
}

/// Whether a human granted permission after the agent's latest blocked query.
///
/// Replies that came before that query do not count.
#[must_use]
pub fn has_blocked_issue_permission(
    issue: &Issue,
    agent_user_id: &str,
    matcher: &dyn PermissionMatcher,
) -> bool {
    let is_agent = |author: Option<&str>| author == Some(agent_user_id);

    let Some(query_index) = issue
        .comments
        .iter()
        .rposition(|c| is_agent(c.author_id.as_deref()) && matcher.is_blocked_query(&c.body))
    else {
        return false;
    };

    issue.comments[query_index + 1..]
        .iter()
        .filter(|c| !is_agent(c.author_id.as_deref()))
        .any(|c| matcher.grants_permission(&c.body))
}

/// Comment explaining why the agent is not starting.
#[must_use]
pub fn blocked_message(blocking: &[String]) -> String {
    let subject = match blocking {
        [single] => format!("issue {single}"),
        many => format!("issues {}", many.join(", ")),
    };
    format!(
        "I can't start on this yet because it's blocked by {subject}. \
         Reply \"proceed\" if you'd like me to go ahead anyway."
    )
}

/// Apply the gate. Returns `true` when work may start; otherwise posts an
/// explanation and returns `false`.
pub async fn handle_blocked_issue(
    tracker: &dyn IssueTracker,
    issue: &Issue,
    agent_user_id: &str,
    matcher: &dyn PermissionMatcher,
) -> bool {
    if !issue.is_blocked() {
        return true;
    }

    if has_blocked_issue_permission(issue, agent_user_id, matcher) {
        info!(issue = %issue.identifier, "Proceeding on blocked issue with permission");
        return true;
    }

    let message = blocked_message(&issue.blocking_identifiers());
    match tracker.create_comment(&issue.id, &message).await {
        Ok(true) => info!(issue = %issue.identifier, "Posted blocked-issue notice"),
        Ok(false) => warn!(issue = %issue.identifier, "Tracker refused blocked-issue notice"),
        Err(e) => warn!(issue = %issue.identifier, error = %e, "Failed to post blocked-issue notice"),
    }
    false
}
