//! Prompt templates.

use std::path::Path;

use handlebars::Handlebars;
use serde::Serialize;

use crate::error::OrchestratorError;
use crate::issue::Issue;
use crate::workspace::Workspace;

const ISSUE_TEMPLATE: &str = "issue";
const RESUME_TEMPLATE: &str = "resume";
const DETAILS_PARTIAL: &str = "issue_details";

/// Renders the prompts handed to the agent.
pub struct PromptBuilder {
    handlebars: Handlebars<'static>,
}

#[derive(Serialize)]
struct IssueContext<'a> {
    id: &'a str,
    identifier: &'a str,
    title: &'a str,
    description: &'a str,
    state: &'a str,
    priority: Option<f64>,
    url: &'a str,
}

#[derive(Serialize)]
struct CommentContext<'a> {
    id: &'a str,
    author: &'a str,
    created_at: String,
    parent_id: Option<&'a str>,
    body: &'a str,
}

#[derive(Serialize)]
struct PromptContext<'a> {
    issue: IssueContext<'a>,
    comments: Vec<CommentContext<'a>>,
    branch: &'a str,
    working_directory: String,
    attachments: Option<&'a str>,
}

impl PromptBuilder {
    /// Builder with the embedded templates.
    pub fn new() -> Result<Self, OrchestratorError> {
        Self::with_issue_template(DEFAULT_ISSUE_TEMPLATE)
    }

    /// Builder whose initial-prompt template is read from `path`.
    pub fn from_file(path: &Path) -> Result<Self, OrchestratorError> {
        let template = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::Prompt(format!("reading {}: {e}", path.display()))
        })?;
        Self::with_issue_template(&template)
    }

    fn with_issue_template(template: &str) -> Result<Self, OrchestratorError> {
        let mut handlebars = Handlebars::new();
        handlebars.register_escape_fn(escape_xml);
        handlebars.set_strict_mode(false);

        handlebars
            .register_partial(DETAILS_PARTIAL, ISSUE_DETAILS_PARTIAL)
            .map_err(|e| OrchestratorError::Prompt(e.to_string()))?;
        handlebars
            .register_template_string(ISSUE_TEMPLATE, template)
            .map_err(|e| OrchestratorError::Prompt(e.to_string()))?;
        handlebars
            .register_template_string(RESUME_TEMPLATE, RESUME_PROMPT_TEMPLATE)
            .map_err(|e| OrchestratorError::Prompt(e.to_string()))?;

        Ok(Self { handlebars })
    }

    /// Prompt that starts work on an issue.
    pub fn build_initial(
        &self,
        issue: &Issue,
        workspace: &Workspace,
        attachments: Option<&str>,
    ) -> Result<String, OrchestratorError> {
        self.render(ISSUE_TEMPLATE, issue, workspace, attachments)
    }

    /// Prompt for a fresh session after the previous one ran out of context.
    pub fn build_resume(
        &self,
        issue: &Issue,
        workspace: &Workspace,
    ) -> Result<String, OrchestratorError> {
        self.render(RESUME_TEMPLATE, issue, workspace, None)
    }

    fn render(
        &self,
        template: &str,
        issue: &Issue,
        workspace: &Workspace,
        attachments: Option<&str>,
    ) -> Result<String, OrchestratorError> {
        let comments = issue
            .comments
            .iter()
            .map(|c| CommentContext {
                id: &c.id,
                author: c
                    .author_name
                    .as_deref()
                    .or(c.author_id.as_deref())
                    .unwrap_or("unknown"),
                created_at: c.created_at.to_rfc3339(),
                parent_id: c.parent_id.as_deref(),
                body: &c.body,
            })
            .collect();

        let context = PromptContext {
            issue: IssueContext {
                id: &issue.id,
                identifier: &issue.identifier,
                title: &issue.title,
                description: issue.description.as_deref().unwrap_or(""),
                state: issue.state.as_deref().unwrap_or(""),
                priority: issue.priority,
                url: issue.url.as_deref().unwrap_or(""),
            },
            comments,
            branch: &workspace.branch,
            working_directory: workspace.path.display().to_string(),
            attachments,
        };

        self.handlebars
            .render(template, &context)
            .map_err(|e| OrchestratorError::Prompt(e.to_string()))
    }
}

/// XML-escape text placed inside the prompt's tags.
#[must_use]
pub fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

const ISSUE_DETAILS_PARTIAL: &str = r#"<linear_issue>
  <id>{{issue.id}}</id>
  <identifier>{{issue.identifier}}</identifier>
  <title>{{issue.title}}</title>
  <description>{{issue.description}}</description>
  <state>{{issue.state}}</state>
{{#if issue.priority}}  <priority>{{issue.priority}}</priority>
{{/if}}  <url>{{issue.url}}</url>
</linear_issue>

<linear_comments>
{{#each comments}}  <comment id="{{id}}" author="{{author}}" created_at="{{created_at}}"{{#if parent_id}} parent_id="{{parent_id}}"{{/if}}>
{{body}}
  </comment>
{{/each}}</linear_comments>
"#;

const DEFAULT_ISSUE_TEMPLATE: &str = r#"You are the assignee of Linear issue {{issue.identifier}}.
Your working directory is {{working_directory}}, checked out on branch `{{branch}}`.

{{> issue_details}}
{{#if attachments}}
{{{attachments}}}
{{/if}}
Work on the issue in this repository. Commit your changes on the branch when you are done.
Finish with a short summary of what you changed; it will be posted as a comment on the issue.
"#;

const RESUME_PROMPT_TEMPLATE: &str = r#"Your previous session on Linear issue {{issue.identifier}} ran out of context.
The working directory {{working_directory}} (branch `{{branch}}`) still contains everything you did so far.
Start by inspecting it with `git status` and `git log`, then continue where you left off.

{{> issue_details}}
Finish with a short summary of what you changed; it will be posted as a comment on the issue.
"#;
