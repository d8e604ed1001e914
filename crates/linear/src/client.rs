//! Linear GraphQL API client.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::activities::{
    AgentActivityCreateInput, AgentActivityCreatePayload, AGENT_ACTIVITY_CREATE_MUTATION,
};
use crate::error::{LinearError, Result};
use crate::models::{Connection, Issue, User, ISSUE_FIELDS};

/// Default Linear GraphQL endpoint.
pub const DEFAULT_API_URL: &str = "https://api.linear.app/graphql";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const VIEWER_QUERY: &str = r"
query Viewer {
    viewer {
        id
        name
        email
    }
}
";

const COMMENT_CREATE_MUTATION: &str = r"
mutation CommentCreate($input: CommentCreateInput!) {
    commentCreate(input: $input) {
        success
        comment {
            id
        }
    }
}
";

const COMMENT_RESOLVE_MUTATION: &str = r"
mutation CommentResolve($id: String!, $resolvingCommentId: String) {
    commentResolve(id: $id, resolvingCommentId: $resolvingCommentId) {
        success
    }
}
";

const AGENT_SESSION_CREATE_MUTATION: &str = r"
mutation AgentSessionCreateOnIssue($input: AgentSessionCreateOnIssue!) {
    agentSessionCreateOnIssue(input: $input) {
        success
        agentSession {
            id
        }
    }
}
";

/// Result of posting a comment.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommentCreated {
    pub success: bool,
    pub comment_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlErrorMessage>,
}

#[derive(Debug, Deserialize)]
struct GraphQlErrorMessage {
    message: String,
}

#[derive(Debug, Deserialize)]
struct IdOnly {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MutationResult {
    success: bool,
    #[serde(default)]
    comment: Option<IdOnly>,
    #[serde(default)]
    agent_session: Option<IdOnly>,
}

/// Linear GraphQL client.
#[derive(Clone)]
pub struct LinearClient {
    client: reqwest::Client,
    api_url: String,
    access_token: String,
}

impl std::fmt::Debug for LinearClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinearClient")
            .field("api_url", &self.api_url)
            .finish_non_exhaustive()
    }
}

impl LinearClient {
    /// Create a client against the public Linear API.
    pub fn new(access_token: &str) -> Result<Self> {
        Self::with_api_url(access_token, DEFAULT_API_URL)
    }

    /// Create a client against a custom endpoint.
    pub fn with_api_url(access_token: &str, api_url: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&authorization_value(access_token))
                .map_err(|_| LinearError::InvalidToken)?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            api_url: api_url.to_string(),
            access_token: access_token.to_string(),
        })
    }

    /// Value of the `Authorization` header this client sends.
    #[must_use]
    pub fn authorization(&self) -> String {
        authorization_value(&self.access_token)
    }

    /// Underlying HTTP client (carries the auth headers).
    #[must_use]
    pub fn http(&self) -> &reqwest::Client {
        &self.client
    }

    async fn execute<T: DeserializeOwned>(&self, query: &str, variables: Value) -> Result<T> {
        let response = self
            .client
            .post(&self.api_url)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LinearError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let payload: GraphQlResponse<T> = response.json().await?;
        if !payload.errors.is_empty() {
            return Err(LinearError::GraphQl(
                payload.errors.into_iter().map(|e| e.message).collect(),
            ));
        }
        payload.data.ok_or(LinearError::MissingData("query"))
    }

    /// The user the token belongs to.
    pub async fn viewer(&self) -> Result<User> {
        #[derive(Deserialize)]
        struct Data {
            viewer: User,
        }

        let data: Data = self.execute(VIEWER_QUERY, json!({})).await?;
        Ok(data.viewer)
    }

    /// Fetch one issue with comments and blocking relations.
    pub async fn fetch_issue(&self, issue_id: &str) -> Result<Issue> {
        #[derive(Deserialize)]
        struct Data {
            issue: Option<Issue>,
        }

        let query = format!(
            "query Issue($id: String!) {{\n    issue(id: $id) {{{ISSUE_FIELDS}    }}\n}}"
        );
        let data: Data = self.execute(&query, json!({ "id": issue_id })).await?;
        data.issue.ok_or(LinearError::MissingData("issue"))
    }

    /// Open issues assigned to `user_id`.
    pub async fn fetch_assigned_issues(&self, user_id: &str) -> Result<Vec<Issue>> {
        #[derive(Deserialize)]
        struct Data {
            issues: Connection<Issue>,
        }

        let query = format!(
            "query AssignedIssues($userId: ID!) {{\n    issues(\n        filter: {{ assignee: {{ id: {{ eq: $userId }} }}, state: {{ type: {{ nin: [\"completed\", \"canceled\"] }} }} }}\n        first: 50\n    ) {{\n        nodes {{{ISSUE_FIELDS}        }}\n    }}\n}}"
        );
        let data: Data = self.execute(&query, json!({ "userId": user_id })).await?;
        debug!(user_id = %user_id, count = data.issues.nodes.len(), "Fetched assigned issues");
        Ok(data.issues.nodes)
    }

    /// Post a top-level comment on an issue.
    pub async fn create_comment(&self, issue_id: &str, body: &str) -> Result<bool> {
        Ok(self
            .create_comment_and_get_id(issue_id, body, None)
            .await?
            .success)
    }

    /// Post a comment, optionally as a reply within `parent_id`'s thread.
    pub async fn create_comment_and_get_id(
        &self,
        issue_id: &str,
        body: &str,
        parent_id: Option<&str>,
    ) -> Result<CommentCreated> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Data {
            comment_create: MutationResult,
        }

        let mut input = json!({ "issueId": issue_id, "body": body });
        if let Some(parent_id) = parent_id {
            input["parentId"] = json!(parent_id);
        }

        let data: Data = self
            .execute(COMMENT_CREATE_MUTATION, json!({ "input": input }))
            .await?;
        Ok(CommentCreated {
            success: data.comment_create.success,
            comment_id: data.comment_create.comment.map(|c| c.id),
        })
    }

    /// Mark the thread rooted at `comment_id` as resolved.
    ///
    /// Never fails: transport errors, GraphQL errors and `success: false`
    /// are logged and reported as `false`.
    pub async fn resolve_comment_thread(
        &self,
        comment_id: &str,
        resolving_comment_id: Option<&str>,
    ) -> bool {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Data {
            comment_resolve: MutationResult,
        }

        let variables = json!({
            "id": comment_id,
            "resolvingCommentId": resolving_comment_id,
        });

        match self
            .execute::<Data>(COMMENT_RESOLVE_MUTATION, variables)
            .await
        {
            Ok(data) if data.comment_resolve.success => {
                debug!(comment_id = %comment_id, "Resolved comment thread");
                true
            }
            Ok(_) => {
                warn!(comment_id = %comment_id, "Linear reported failure resolving comment thread");
                false
            }
            Err(e) => {
                warn!(comment_id = %comment_id, error = %e, "Failed to resolve comment thread");
                false
            }
        }
    }

    /// Open a Linear agent session on an issue. Returns its id.
    pub async fn create_agent_session(&self, issue_id: &str) -> Result<Option<String>> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Data {
            agent_session_create_on_issue: MutationResult,
        }

        let data: Data = self
            .execute(
                AGENT_SESSION_CREATE_MUTATION,
                json!({ "input": { "issueId": issue_id } }),
            )
            .await?;
        let result = data.agent_session_create_on_issue;
        Ok(if result.success {
            result.agent_session.map(|s| s.id)
        } else {
            None
        })
    }

    /// Create an agent activity. Returns the activity id when Linear accepted it.
    pub async fn create_agent_activity(
        &self,
        input: &AgentActivityCreateInput,
    ) -> Result<Option<String>> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Data {
            agent_activity_create: AgentActivityCreatePayload,
        }

        let data: Data = self
            .execute(AGENT_ACTIVITY_CREATE_MUTATION, json!({ "input": input }))
            .await?;
        let payload = data.agent_activity_create;
        if !payload.success {
            warn!(
                session_id = %input.agent_session_id,
                kind = input.content.kind(),
                "Linear rejected agent activity"
            );
            return Ok(None);
        }
        Ok(payload.agent_activity.map(|a| a.id))
    }
}

/// Linear API keys (`lin_api_*`) are sent without the `Bearer` prefix.
fn authorization_value(access_token: &str) -> String {
    if access_token.starts_with("lin_api_") {
        access_token.to_string()
    } else {
        format!("Bearer {access_token}")
    }
}
