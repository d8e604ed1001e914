//! Error types for the Linear client.

use thiserror::Error;

/// Errors returned by the Linear API client.
#[derive(Debug, Error)]
pub enum LinearError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The API answered with a non-success status code
    #[error("Linear API returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// The GraphQL response carried errors
    #[error("GraphQL error: {}", .0.join("; "))]
    GraphQl(Vec<String>),

    /// The response had no `data` payload
    #[error("GraphQL response missing data for {0}")]
    MissingData(&'static str),

    /// The token was rejected by the API
    #[error("Authentication required: {0}")]
    Authentication(String),

    /// No credential source produced a token
    #[error("No authentication method available (no OAuth token, API key or personal access token)")]
    NoCredentials,

    /// The access token contains characters that cannot be sent as a header
    #[error("Invalid access token")]
    InvalidToken,

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error while reading a token file
    #[error("Failed to read token file: {0}")]
    Io(#[from] std::io::Error),
}

impl LinearError {
    /// Whether the error means the current token should be discarded.
    #[must_use]
    pub fn is_auth_error(&self) -> bool {
        match self {
            Self::Authentication(_) => true,
            Self::Status { status, .. } => *status == 401 || *status == 403,
            Self::GraphQl(messages) => messages.iter().any(|m| {
                let lower = m.to_lowercase();
                lower.contains("authentication required") || lower.contains("not authenticated")
            }),
            _ => false,
        }
    }
}

/// Convenience result alias for the Linear client.
pub type Result<T, E = LinearError> = std::result::Result<T, E>;
