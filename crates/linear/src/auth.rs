//! Credential resolution and a self-refreshing client wrapper.
//!
//! [`AuthenticatedClient`] owns the only [`LinearClient`] the service uses.
//! Every call goes through a cached client that is rebuilt when it is older
//! than the re-init interval, when [`AuthenticatedClient::force_reinit`] was
//! requested, or after the API rejected the token.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::activities::AgentActivityCreateInput;
use crate::client::{CommentCreated, LinearClient, DEFAULT_API_URL};
use crate::error::{LinearError, Result};
use crate::models::{Issue, User};

/// Default lifetime of a cached client before it is rebuilt.
pub const DEFAULT_REINIT_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// A resolved access token and where it came from.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    OAuth(String),
    ApiKey(String),
    PersonalAccessToken(String),
}

impl Credential {
    #[must_use]
    pub fn token(&self) -> &str {
        match self {
            Self::OAuth(t) | Self::ApiKey(t) | Self::PersonalAccessToken(t) => t,
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::OAuth(_) => "oauth",
            Self::ApiKey(_) => "api_key",
            Self::PersonalAccessToken(_) => "personal_access_token",
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Credential::{}(<redacted>)", self.kind())
    }
}

/// Where tokens are looked up, in priority order:
/// OAuth token file, then API key, then personal access token.
#[derive(Debug, Clone, Default)]
pub struct CredentialSource {
    oauth_token_file: Option<PathBuf>,
    api_key: Option<String>,
    personal_access_token: Option<String>,
}

#[derive(Deserialize)]
struct TokenFile {
    #[serde(alias = "accessToken")]
    access_token: String,
}

impl CredentialSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_oauth_token_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.oauth_token_file = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn with_personal_access_token(mut self, token: impl Into<String>) -> Self {
        self.personal_access_token = Some(token.into());
        self
    }

    /// Whether any credential source is configured at all.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.oauth_token_file.is_some()
            || self.api_key.is_some()
            || self.personal_access_token.is_some()
    }

    /// All usable credentials in priority order.
    ///
    /// A token file may hold either the bare token or a JSON object with an
    /// `access_token` field. Unreadable files are skipped.
    pub async fn candidates(&self) -> Vec<Credential> {
        let mut found = Vec::new();

        if let Some(path) = &self.oauth_token_file {
            match tokio::fs::read_to_string(path).await {
                Ok(contents) => {
                    if let Some(token) = parse_token_file(&contents) {
                        found.push(Credential::OAuth(token));
                    }
                }
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "OAuth token file unavailable");
                }
            }
        }
        if let Some(key) = non_empty(self.api_key.as_deref()) {
            found.push(Credential::ApiKey(key));
        }
        if let Some(token) = non_empty(self.personal_access_token.as_deref()) {
            found.push(Credential::PersonalAccessToken(token));
        }

        found
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

fn parse_token_file(contents: &str) -> Option<String> {
    let trimmed = contents.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str::<TokenFile>(trimmed)
            .ok()
            .and_then(|f| non_empty(Some(&f.access_token)));
    }
    non_empty(Some(trimmed))
}

struct CachedClient {
    client: LinearClient,
    viewer: User,
    credential_kind: &'static str,
    initialized_at: Instant,
}

/// Linear client wrapper that validates and refreshes its token.
pub struct AuthenticatedClient {
    source: CredentialSource,
    api_url: String,
    reinit_interval: Duration,
    force_reinit: AtomicBool,
    cached: Mutex<Option<CachedClient>>,
}

impl AuthenticatedClient {
    #[must_use]
    pub fn new(source: CredentialSource) -> Self {
        Self {
            source,
            api_url: DEFAULT_API_URL.to_string(),
            reinit_interval: DEFAULT_REINIT_INTERVAL,
            force_reinit: AtomicBool::new(false),
            cached: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    #[must_use]
    pub fn with_reinit_interval(mut self, interval: Duration) -> Self {
        self.reinit_interval = interval;
        self
    }

    /// Discard the cached client on the next call.
    pub fn force_reinit(&self) {
        self.force_reinit.store(true, Ordering::SeqCst);
    }

    /// Return a validated client, building a new one if needed.
    pub async fn client(&self) -> Result<LinearClient> {
        let mut cached = self.cached.lock().await;
        let forced = self.force_reinit.swap(false, Ordering::SeqCst);

        if let Some(current) = cached.as_ref() {
            if !forced && current.initialized_at.elapsed() < self.reinit_interval {
                return Ok(current.client.clone());
            }
            debug!(forced, "Re-initialising Linear client");
        }

        let fresh = self.initialize().await?;
        let client = fresh.client.clone();
        *cached = Some(fresh);
        Ok(client)
    }

    /// The user the active token belongs to.
    pub async fn viewer(&self) -> Result<User> {
        self.client().await?;
        let cached = self.cached.lock().await;
        cached
            .as_ref()
            .map(|c| c.viewer.clone())
            .ok_or(LinearError::NoCredentials)
    }

    /// Which credential kind the active client was built from.
    pub async fn credential_kind(&self) -> Option<&'static str> {
        self.cached.lock().await.as_ref().map(|c| c.credential_kind)
    }

    async fn initialize(&self) -> Result<CachedClient> {
        let candidates = self.source.candidates().await;
        let mut last_error = None;

        for credential in candidates {
            let client = match LinearClient::with_api_url(credential.token(), &self.api_url) {
                Ok(client) => client,
                Err(e) => {
                    warn!(kind = credential.kind(), error = %e, "Skipping unusable credential");
                    last_error = Some(e);
                    continue;
                }
            };

            match client.viewer().await {
                Ok(viewer) => {
                    info!(
                        kind = credential.kind(),
                        viewer_id = %viewer.id,
                        "Authenticated with Linear"
                    );
                    return Ok(CachedClient {
                        client,
                        viewer,
                        credential_kind: credential.kind(),
                        initialized_at: Instant::now(),
                    });
                }
                Err(e) => {
                    warn!(kind = credential.kind(), error = %e, "Linear credential rejected");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(LinearError::NoCredentials))
    }

    /// Drop the cached client if the call failed on authentication.
    async fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_auth_error() {
                warn!(error = %e, "Linear rejected token, resetting client");
                *self.cached.lock().await = None;
            }
        }
        result
    }

    pub async fn fetch_issue(&self, issue_id: &str) -> Result<Issue> {
        let client = self.client().await?;
        self.observe(client.fetch_issue(issue_id).await).await
    }

    pub async fn fetch_assigned_issues(&self, user_id: &str) -> Result<Vec<Issue>> {
        let client = self.client().await?;
        self.observe(client.fetch_assigned_issues(user_id).await)
            .await
    }

    pub async fn create_comment(&self, issue_id: &str, body: &str) -> Result<bool> {
        let client = self.client().await?;
        self.observe(client.create_comment(issue_id, body).await)
            .await
    }

    pub async fn create_comment_and_get_id(
        &self,
        issue_id: &str,
        body: &str,
        parent_id: Option<&str>,
    ) -> Result<CommentCreated> {
        let client = self.client().await?;
        self.observe(
            client
                .create_comment_and_get_id(issue_id, body, parent_id)
                .await,
        )
        .await
    }

    pub async fn resolve_comment_thread(
        &self,
        comment_id: &str,
        resolving_comment_id: Option<&str>,
    ) -> bool {
        match self.client().await {
            Ok(client) => {
                client
                    .resolve_comment_thread(comment_id, resolving_comment_id)
                    .await
            }
            Err(e) => {
                warn!(comment_id = %comment_id, error = %e, "No Linear client for thread resolution");
                false
            }
        }
    }

    pub async fn create_agent_session(&self, issue_id: &str) -> Result<Option<String>> {
        let client = self.client().await?;
        self.observe(client.create_agent_session(issue_id).await)
            .await
    }

    pub async fn create_agent_activity(
        &self,
        input: &AgentActivityCreateInput,
    ) -> Result<Option<String>> {
        let client = self.client().await?;
        self.observe(client.create_agent_activity(input).await)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_file_formats() {
        assert_eq!(parse_token_file("  tok-123\n"), Some("tok-123".into()));
        assert_eq!(
            parse_token_file(r#"{"access_token":"tok-json"}"#),
            Some("tok-json".into())
        );
        assert_eq!(
            parse_token_file(r#"{"accessToken":"tok-camel"}"#),
            Some("tok-camel".into())
        );
        assert_eq!(parse_token_file("   "), None);
    }

    #[tokio::test]
    async fn test_candidates_follow_priority_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        tokio::fs::write(&path, "oauth-token").await.unwrap();

        let source = CredentialSource::new()
            .with_personal_access_token("pat")
            .with_api_key("lin_api_key")
            .with_oauth_token_file(&path);

        let kinds: Vec<_> = source
            .candidates()
            .await
            .iter()
            .map(Credential::kind)
            .collect();
        assert_eq!(kinds, vec!["oauth", "api_key", "personal_access_token"]);
    }

    #[tokio::test]
    async fn test_missing_token_file_is_skipped() {
        let source = CredentialSource::new()
            .with_oauth_token_file("/nonexistent/linear-token")
            .with_api_key("lin_api_key");

        let candidates = source.candidates().await;
        assert_eq!(candidates, vec![Credential::ApiKey("lin_api_key".into())]);
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let rendered = format!("{:?}", Credential::ApiKey("lin_api_secret".into()));
        assert!(!rendered.contains("secret"));
    }

    #[tokio::test]
    async fn test_no_credentials() {
        let client = AuthenticatedClient::new(CredentialSource::new());
        let err = client.client().await.unwrap_err();
        assert!(matches!(err, LinearError::NoCredentials));
    }
}
