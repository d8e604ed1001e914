//! Service configuration loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use linear::{CredentialSource, DEFAULT_API_URL};

/// Tools the agent may use unless `ALLOWED_TOOLS` says otherwise.
pub const DEFAULT_ALLOWED_TOOLS: &[&str] = &[
    "Read",
    "Write",
    "Edit",
    "MultiEdit",
    "Glob",
    "Grep",
    "LS",
    "Task",
    "WebFetch",
    "TodoRead",
    "TodoWrite",
    "NotebookRead",
    "NotebookEdit",
    "Batch",
    "Bash",
];

#[derive(Debug, Clone)]
pub struct Config {
    // Linear
    pub linear_api_key: Option<String>,
    pub linear_oauth_token_file: Option<PathBuf>,
    pub linear_personal_access_token: Option<String>,
    pub linear_api_url: String,
    pub webhook_secret: Option<String>,
    pub webhook_max_age_ms: i64,
    /// Skip the `viewer` lookup and act as this user
    pub agent_user_id: Option<String>,

    // Server
    pub http_port: u16,

    // Workspaces
    pub workspace_base_dir: PathBuf,
    pub repository_path: PathBuf,
    pub main_branch: String,
    pub setup_script: String,

    // Agent
    pub agent_executable: String,
    pub agent_model: Option<String>,
    pub allowed_tools: Vec<String>,
    pub max_turns: Option<u32>,
    pub prompt_template_path: Option<PathBuf>,
    pub logs_dir: PathBuf,
    pub download_attachments: bool,

    // State
    pub state_file: PathBuf,
    pub gc_interval_secs: u64,
    pub gc_retention_secs: u64,
}

impl Config {
    /// Load configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let home = data_home();

        Self {
            linear_api_key: non_empty("LINEAR_API_KEY"),
            linear_oauth_token_file: non_empty("LINEAR_OAUTH_TOKEN_FILE").map(PathBuf::from),
            linear_personal_access_token: non_empty("LINEAR_PERSONAL_ACCESS_TOKEN"),
            linear_api_url: std::env::var("LINEAR_API_URL")
                .unwrap_or_else(|_| DEFAULT_API_URL.to_string()),
            webhook_secret: non_empty("LINEAR_WEBHOOK_SECRET"),
            webhook_max_age_ms: parsed("WEBHOOK_MAX_AGE_MS", linear::webhooks::DEFAULT_MAX_WEBHOOK_AGE_MS),
            agent_user_id: non_empty("AGENT_USER_ID"),

            http_port: parsed("HTTP_PORT", 3000),

            workspace_base_dir: non_empty("WORKSPACE_BASE_DIR")
                .map_or_else(|| home.join("workspaces"), PathBuf::from),
            repository_path: non_empty("REPOSITORY_PATH")
                .map_or_else(|| PathBuf::from("."), PathBuf::from),
            main_branch: std::env::var("MAIN_BRANCH").unwrap_or_else(|_| "main".to_string()),
            setup_script: std::env::var("SETUP_SCRIPT")
                .unwrap_or_else(|_| "secretagentsetup.sh".to_string()),

            agent_executable: std::env::var("AGENT_EXECUTABLE")
                .unwrap_or_else(|_| "claude".to_string()),
            agent_model: non_empty("AGENT_MODEL"),
            allowed_tools: non_empty("ALLOWED_TOOLS").map_or_else(
                || DEFAULT_ALLOWED_TOOLS.iter().map(ToString::to_string).collect(),
                |tools| split_list(&tools),
            ),
            max_turns: non_empty("AGENT_MAX_TURNS").and_then(|v| v.parse().ok()),
            prompt_template_path: non_empty("PROMPT_TEMPLATE_PATH").map(PathBuf::from),
            logs_dir: non_empty("AGENT_LOGS_DIR").map_or_else(|| home.join("logs"), PathBuf::from),
            download_attachments: std::env::var("DOWNLOAD_ATTACHMENTS")
                .map(|v| !matches!(v.to_ascii_lowercase().as_str(), "0" | "false" | "no"))
                .unwrap_or(true),

            state_file: non_empty("STATE_FILE")
                .map_or_else(|| home.join("state.json"), PathBuf::from),
            gc_interval_secs: parsed("GC_INTERVAL_SECS", 3600),
            gc_retention_secs: parsed("GC_RETENTION_SECS", 86_400),
        }
    }

    /// Credentials in the order they are tried.
    #[must_use]
    pub fn credential_source(&self) -> CredentialSource {
        let mut source = CredentialSource::new();
        if let Some(path) = &self.linear_oauth_token_file {
            source = source.with_oauth_token_file(path);
        }
        if let Some(key) = &self.linear_api_key {
            source = source.with_api_key(key);
        }
        if let Some(token) = &self.linear_personal_access_token {
            source = source.with_personal_access_token(token);
        }
        source
    }

    #[must_use]
    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs.max(1))
    }

    #[must_use]
    pub fn gc_retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.gc_retention_secs).unwrap_or(i64::MAX / 1000))
    }
}

/// `$HOME/.issue-agent`, or `./.issue-agent` without a home directory.
fn data_home() -> PathBuf {
    std::env::var("HOME")
        .map_or_else(|_| PathBuf::from("."), PathBuf::from)
        .join(".issue-agent")
}

fn non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.trim().is_empty())
}

fn parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}
