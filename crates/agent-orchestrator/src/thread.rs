//! Which comment thread the agent is talking in.

/// Reply routing for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadContext {
    /// Comment that started the agent's side of the conversation
    pub agent_root_comment_id: Option<String>,
    /// Thread of the human comment currently being answered; `None` means the
    /// agent started the thread itself
    pub current_parent_id: Option<String>,
}

impl ThreadContext {
    #[must_use]
    pub fn with_root(root_comment_id: impl Into<String>) -> Self {
        Self {
            agent_root_comment_id: Some(root_comment_id.into()),
            current_parent_id: None,
        }
    }

    /// Thread to reply in and later resolve. A user-initiated thread wins
    /// over the agent's own root.
    #[must_use]
    pub fn target(&self) -> Option<&str> {
        self.current_parent_id
            .as_deref()
            .or(self.agent_root_comment_id.as_deref())
    }

    /// Route the next response into `parent_id`'s thread.
    pub fn reply_within(&mut self, parent_id: impl Into<String>) {
        self.current_parent_id = Some(parent_id.into());
    }

    /// Forget the user thread once it has been answered.
    pub fn clear_reply(&mut self) {
        self.current_parent_id = None;
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.target().is_none()
    }
}
