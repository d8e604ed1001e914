//! Per-issue workspaces backed by git worktrees.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::WorkspaceError;
use crate::issue::Issue;

/// An isolated working directory dedicated to one issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub issue_id: String,
    pub path: PathBuf,
    /// Whether `path` is a git worktree on its own branch
    pub is_git_worktree: bool,
    pub branch: String,
    /// Conversation history file for the issue
    pub history_path: PathBuf,
}

impl Workspace {
    /// Directory name, used to key per-workspace logs.
    #[must_use]
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map_or_else(|| self.issue_id.clone(), |n| n.to_string_lossy().into_owned())
    }
}

/// Creates and removes issue workspaces.
#[async_trait]
pub trait WorkspaceProvisioner: Send + Sync {
    /// Return the issue's workspace, creating it on first use.
    async fn ensure(&self, issue: &Issue) -> Result<Workspace, WorkspaceError>;

    /// Remove one workspace and its checkout.
    async fn cleanup(&self, workspace: &Workspace) -> Result<(), WorkspaceError>;

    /// Remove every known workspace. Individual failures are logged and skipped.
    async fn cleanup_all(&self);
}

/// Provisioner that checks out one git worktree per issue under `base_dir`.
///
/// When `repo_path` is not a git repository the workspace is a plain
/// directory instead.
pub struct GitWorktreeProvisioner {
    repo_path: PathBuf,
    base_dir: PathBuf,
    main_branch: String,
    setup_script: Option<String>,
    known: RwLock<HashMap<String, Workspace>>,
}

impl GitWorktreeProvisioner {
    #[must_use]
    pub fn new(repo_path: impl Into<PathBuf>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
            base_dir: base_dir.into(),
            main_branch: "main".to_string(),
            setup_script: None,
            known: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_main_branch(mut self, branch: impl Into<String>) -> Self {
        self.main_branch = branch.into();
        self
    }

    /// Script (relative to the workspace) run once after creation.
    #[must_use]
    pub fn with_setup_script(mut self, script: impl Into<String>) -> Self {
        self.setup_script = Some(script.into());
        self
    }

    /// Directory for an issue, derived from its identifier.
    #[must_use]
    pub fn workspace_path(&self, issue: &Issue) -> PathBuf {
        self.base_dir.join(sanitize(&issue.identifier))
    }

    fn history_path(&self, issue: &Issue) -> PathBuf {
        self.base_dir
            .join(".history")
            .join(format!("{}.jsonl", sanitize(&issue.identifier)))
    }

    async fn git(&self, cwd: &Path, args: &[&str]) -> Result<String, WorkspaceError> {
        let rendered = format!("git {}", args.join(" "));
        debug!(command = %rendered, cwd = %cwd.display(), "Running git");

        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .await
            .map_err(|source| WorkspaceError::GitIo {
                command: rendered.clone(),
                source,
            })?;

        let stdout =
            String::from_utf8(output.stdout).map_err(|source| WorkspaceError::NonUtf8Output {
                command: rendered.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(WorkspaceError::GitFailed {
                command: rendered,
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(stdout)
    }

    async fn is_git_repository(&self) -> bool {
        self.git(&self.repo_path, &["rev-parse", "--is-inside-work-tree"])
            .await
            .is_ok_and(|out| out.trim() == "true")
    }

    async fn create_worktree(&self, path: &Path, branch: &str) -> Result<(), WorkspaceError> {
        let path_str = path.to_string_lossy();
        let created = self
            .git(
                &self.repo_path,
                &[
                    "worktree",
                    "add",
                    "-b",
                    branch,
                    path_str.as_ref(),
                    self.main_branch.as_str(),
                ],
            )
            .await;

        match created {
            Ok(_) => Ok(()),
            Err(WorkspaceError::GitFailed { stderr, .. }) if stderr.contains("already exists") => {
                info!(branch = %branch, "Branch already exists, checking it out");
                self.git(&self.repo_path, &["worktree", "add", path_str.as_ref(), branch])
                    .await
                    .map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    async fn run_setup_script(&self, path: &Path) {
        let Some(script) = &self.setup_script else {
            return;
        };
        let script_path = path.join(script);
        if !tokio::fs::try_exists(&script_path).await.unwrap_or(false) {
            return;
        }

        info!(script = %script_path.display(), "Running workspace setup script");
        match Command::new("bash")
            .arg(&script_path)
            .current_dir(path)
            .output()
            .await
        {
            Ok(output) if output.status.success() => {
                debug!(script = %script_path.display(), "Setup script finished");
            }
            Ok(output) => warn!(
                script = %script_path.display(),
                exit_code = ?output.status.code(),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "Setup script failed, continuing with workspace"
            ),
            Err(e) => warn!(
                script = %script_path.display(),
                error = %e,
                "Could not run setup script, continuing with workspace"
            ),
        }
    }
}

#[async_trait]
impl WorkspaceProvisioner for GitWorktreeProvisioner {
    async fn ensure(&self, issue: &Issue) -> Result<Workspace, WorkspaceError> {
        if let Some(existing) = self.known.read().await.get(&issue.id) {
            return Ok(existing.clone());
        }

        let mut known = self.known.write().await;
        if let Some(existing) = known.get(&issue.id) {
            return Ok(existing.clone());
        }

        let path = self.workspace_path(issue);
        let branch = issue.branch_name();
        let history_path = self.history_path(issue);
        if let Some(parent) = history_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let is_git_worktree = if tokio::fs::try_exists(&path).await? {
            debug!(path = %path.display(), "Reusing existing workspace directory");
            tokio::fs::try_exists(path.join(".git")).await?
        } else if self.is_git_repository().await {
            tokio::fs::create_dir_all(&self.base_dir).await?;
            self.create_worktree(&path, &branch).await?;
            self.run_setup_script(&path).await;
            true
        } else {
            tokio::fs::create_dir_all(&path).await?;
            self.run_setup_script(&path).await;
            false
        };

        let workspace = Workspace {
            issue_id: issue.id.clone(),
            path,
            is_git_worktree,
            branch,
            history_path,
        };
        info!(
            issue_id = %issue.id,
            identifier = %issue.identifier,
            path = %workspace.path.display(),
            git = workspace.is_git_worktree,
            "Workspace ready"
        );
        known.insert(issue.id.clone(), workspace.clone());
        Ok(workspace)
    }

    async fn cleanup(&self, workspace: &Workspace) -> Result<(), WorkspaceError> {
        if workspace.is_git_worktree {
            let path_str = workspace.path.to_string_lossy();
            if let Err(e) = self
                .git(&self.repo_path, &["worktree", "remove", "--force", path_str.as_ref()])
                .await
            {
                warn!(path = %workspace.path.display(), error = %e, "git worktree remove failed");
            }
        }
        if tokio::fs::try_exists(&workspace.path).await? {
            tokio::fs::remove_dir_all(&workspace.path).await?;
        }
        self.known.write().await.remove(&workspace.issue_id);
        info!(path = %workspace.path.display(), "Workspace removed");
        Ok(())
    }

    async fn cleanup_all(&self) {
        let workspaces: Vec<Workspace> = self.known.read().await.values().cloned().collect();
        for workspace in workspaces {
            if let Err(e) = self.cleanup(&workspace).await {
                warn!(
                    issue_id = %workspace.issue_id,
                    path = %workspace.path.display(),
                    error = %e,
                    "Failed to clean up workspace"
                );
            }
        }
    }
}

/// Keep identifiers usable as a single path component.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect()
}
