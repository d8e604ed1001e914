//! Issue-tracker seam used by the orchestrator.

use async_trait::async_trait;
use linear::{
    ActivityContent, AgentActivityCreateInput, AuthenticatedClient, CommentCreated, LinearError,
};

use crate::agent_session::ActivitySink;
use crate::issue::Issue;

/// Everything the orchestrator needs from the issue tracker.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// Id of the user the agent acts as.
    async fn viewer_id(&self) -> Result<String, LinearError>;

    async fn fetch_issue(&self, issue_id: &str) -> Result<Issue, LinearError>;

    async fn fetch_assigned_issues(&self, user_id: &str) -> Result<Vec<Issue>, LinearError>;

    async fn create_comment(&self, issue_id: &str, body: &str) -> Result<bool, LinearError>;

    async fn create_comment_and_get_id(
        &self,
        issue_id: &str,
        body: &str,
        parent_id: Option<&str>,
    ) -> Result<CommentCreated, LinearError>;

    /// Mark a thread resolved. Never fails; `false` means it did not happen.
    async fn resolve_comment_thread(
        &self,
        comment_id: &str,
        resolving_comment_id: Option<&str>,
    ) -> bool;

    /// Open a tracker-side agent session; `None` when the tracker declines.
    async fn create_agent_session(&self, issue_id: &str) -> Result<Option<String>, LinearError>;

    async fn create_agent_activity(
        &self,
        input: &AgentActivityCreateInput,
    ) -> Result<Option<String>, LinearError>;

    /// `Authorization` header value for fetching tracker-hosted files.
    async fn authorization(&self) -> Option<String>;
}

#[async_trait]
impl IssueTracker for AuthenticatedClient {
    async fn viewer_id(&self) -> Result<String, LinearError> {
        self.viewer().await.map(|user| user.id)
    }

    async fn fetch_issue(&self, issue_id: &str) -> Result<Issue, LinearError> {
        AuthenticatedClient::fetch_issue(self, issue_id)
            .await
            .map(Issue::from)
    }

    async fn fetch_assigned_issues(&self, user_id: &str) -> Result<Vec<Issue>, LinearError> {
        let issues = AuthenticatedClient::fetch_assigned_issues(self, user_id).await?;
        Ok(issues.into_iter().map(Issue::from).collect())
    }

    async fn create_comment(&self, issue_id: &str, body: &str) -> Result<bool, LinearError> {
        AuthenticatedClient::create_comment(self, issue_id, body).await
    }

    async fn create_comment_and_get_id(
        &self,
        issue_id: &str,
        body: &str,
        parent_id: Option<&str>,
    ) -> Result<CommentCreated, LinearError> {
        AuthenticatedClient::create_comment_and_get_id(self, issue_id, body, parent_id).await
    }

    async fn resolve_comment_thread(
        &self,
        comment_id: &str,
        resolving_comment_id: Option<&str>,
    ) -> bool {
        AuthenticatedClient::resolve_comment_thread(self, comment_id, resolving_comment_id).await
    }

    async fn create_agent_session(&self, issue_id: &str) -> Result<Option<String>, LinearError> {
        AuthenticatedClient::create_agent_session(self, issue_id).await
    }

    async fn create_agent_activity(
        &self,
        input: &AgentActivityCreateInput,
    ) -> Result<Option<String>, LinearError> {
        AuthenticatedClient::create_agent_activity(self, input).await
    }

    async fn authorization(&self) -> Option<String> {
        self.client().await.ok().map(|client| client.authorization())
    }
}

#[async_trait]
impl<T: IssueTracker + ?Sized> ActivitySink for T {
    async fn post_activity(
        &self,
        agent_session_id: &str,
        content: ActivityContent,
    ) -> Result<Option<String>, LinearError> {
        let input = AgentActivityCreateInput::new(agent_session_id, content);
        self.create_agent_activity(&input).await
    }
}
