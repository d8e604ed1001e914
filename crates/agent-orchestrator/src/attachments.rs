//! Download files uploaded to Linear so the agent can read them locally.

use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use tracing::{debug, info, warn};

use crate::issue::Issue;
use crate::prompt::escape_xml;

/// Maximum number of files fetched per issue.
pub const MAX_ATTACHMENTS: usize = 10;

/// Directory inside the workspace that receives downloads.
pub const ATTACHMENTS_DIR: &str = ".attachments";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub url: String,
    pub path: PathBuf,
}

/// What was fetched for one issue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachmentManifest {
    pub attachments: Vec<Attachment>,
    /// Downloads that failed
    pub failed: usize,
    /// URLs beyond the cap
    pub skipped: usize,
}

impl AttachmentManifest {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attachments.is_empty()
    }

    /// Prompt section listing the local copies.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::from("<linear_attachments>\n");
        for attachment in &self.attachments {
            out.push_str(&format!(
                "  <attachment url=\"{}\" path=\"{}\"/>\n",
                escape_xml(&attachment.url),
                escape_xml(&attachment.path.display().to_string())
            ));
        }
        out.push_str("</linear_attachments>\n");
        if self.skipped > 0 {
            out.push_str(&format!(
                "{} more attachment(s) were not downloaded (limit {MAX_ATTACHMENTS}).\n",
                self.skipped
            ));
        }
        out
    }
}

pub struct AttachmentDownloader {
    client: reqwest::Client,
    url_pattern: Regex,
    max_attachments: usize,
}

impl AttachmentDownloader {
    pub fn new() -> Result<Self, regex::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Ok(Self {
            client,
            url_pattern: Regex::new(r#"https://uploads\.linear\.app/[^\s)\]"'<>]+"#)?,
            max_attachments: MAX_ATTACHMENTS,
        })
    }

    #[must_use]
    pub fn with_max_attachments(mut self, max: usize) -> Self {
        self.max_attachments = max;
        self
    }

    /// Upload URLs in the description and comments, first occurrence first.
    #[must_use]
    pub fn extract_urls(&self, issue: &Issue) -> Vec<String> {
        let texts = issue
            .description
            .iter()
            .map(String::as_str)
            .chain(issue.comments.iter().map(|c| c.body.as_str()));

        let mut urls: Vec<String> = Vec::new();
        for text in texts {
            for found in self.url_pattern.find_iter(text) {
                let url = found.as_str().to_string();
                if !urls.contains(&url) {
                    urls.push(url);
                }
            }
        }
        urls
    }

    /// Fetch the issue's uploads into `<workspace>/.attachments/`.
    pub async fn download_for_issue(
        &self,
        issue: &Issue,
        workspace_path: &Path,
        authorization: Option<&str>,
    ) -> AttachmentManifest {
        let urls = self.extract_urls(issue);
        if urls.is_empty() {
            return AttachmentManifest::default();
        }
        let manifest = self
            .download_urls(&urls, &workspace_path.join(ATTACHMENTS_DIR), authorization)
            .await;
        info!(
            issue = %issue.identifier,
            downloaded = manifest.attachments.len(),
            failed = manifest.failed,
            skipped = manifest.skipped,
            "Attachments processed"
        );
        manifest
    }

    /// Fetch up to the cap of `urls` into `dir`. Failures are counted, not returned.
    pub async fn download_urls(
        &self,
        urls: &[String],
        dir: &Path,
        authorization: Option<&str>,
    ) -> AttachmentManifest {
        let mut manifest = AttachmentManifest {
            skipped: urls.len().saturating_sub(self.max_attachments),
            ..AttachmentManifest::default()
        };

        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            warn!(dir = %dir.display(), error = %e, "Cannot create attachments directory");
            manifest.failed = urls.len().min(self.max_attachments);
            return manifest;
        }

        for (index, url) in urls.iter().take(self.max_attachments).enumerate() {
            match self.download(url, dir, index + 1, authorization).await {
                Ok(path) => {
                    debug!(url = %url, path = %path.display(), "Downloaded attachment");
                    manifest.attachments.push(Attachment {
                        url: url.clone(),
                        path,
                    });
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "Failed to download attachment");
                    manifest.failed += 1;
                }
            }
        }
        manifest
    }

    async fn download(
        &self,
        url: &str,
        dir: &Path,
        index: usize,
        authorization: Option<&str>,
    ) -> anyhow::Result<PathBuf> {
        let mut request = self.client.get(url);
        if let Some(auth) = authorization {
            request = request.header(AUTHORIZATION, auth);
        }
        let response = request.send().await?.error_for_status()?;

        let extension = extension_for(
            url,
            response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok()),
        );
        let bytes = response.bytes().await?;

        let path = dir.join(format!("attachment_{index}.{extension}"));
        tokio::fs::write(&path, &bytes).await?;
        Ok(path)
    }
}

/// File extension from the URL path, else from the content type.
fn extension_for(url: &str, content_type: Option<&str>) -> String {
    let from_url = url
        .split(['?', '#'])
        .next()
        .and_then(|path| path.rsplit('/').next())
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()));
    if let Some(ext) = from_url {
        return ext;
    }

    let mime = content_type
        .and_then(|ct| ct.split(';').next())
        .map(str::trim)
        .unwrap_or_default();
    match mime {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/svg+xml" => "svg",
        "application/pdf" => "pdf",
        "text/plain" => "txt",
        "application/json" => "json",
        _ => "bin",
    }
    .to_string()
}
