//! Agent orchestrator service.
//!
//! Listens for Linear app-user webhooks and runs one coding-agent session
//! per assigned issue. Every option is read from the environment and can be
//! overridden on the command line.

use std::path::PathBuf;
use std::sync::Arc;

use agent_orchestrator::attachments::AttachmentDownloader;
use agent_orchestrator::persistence::StateStore;
use agent_orchestrator::prompt::PromptBuilder;
use agent_orchestrator::server::{build_router, ServerState};
use agent_orchestrator::{AgentSettings, AppContext, Config, GitWorktreeProvisioner, Orchestrator};
use agent_runner::ClaudeCliBackend;
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use linear::AuthenticatedClient;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "agent-orchestrator")]
#[command(about = "Run a coding agent as the assignee of Linear issues")]
#[command(version)]
struct Cli {
    /// Port for the webhook server
    #[arg(long)]
    port: Option<u16>,

    /// Repository the per-issue worktrees are created from
    #[arg(long)]
    repository: Option<PathBuf>,

    /// Directory holding the per-issue workspaces
    #[arg(long)]
    workspace_dir: Option<PathBuf>,

    /// Agent CLI executable
    #[arg(long)]
    agent: Option<String>,

    /// Model passed to the agent CLI
    #[arg(long)]
    model: Option<String>,

    /// Handlebars template replacing the built-in issue prompt
    #[arg(long)]
    prompt_template: Option<PathBuf>,

    /// Do not pick up already-assigned issues at startup
    #[arg(long, env = "SKIP_STARTUP_RESUME")]
    skip_startup: bool,

    #[arg(long, value_enum, env = "LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,
}

impl Cli {
    fn apply(self, mut config: Config) -> Config {
        if let Some(port) = self.port {
            config.http_port = port;
        }
        if let Some(repository) = self.repository {
            config.repository_path = repository;
        }
        if let Some(dir) = self.workspace_dir {
            config.workspace_base_dir = dir;
        }
        if let Some(agent) = self.agent {
            config.agent_executable = agent;
        }
        if self.model.is_some() {
            config.agent_model = self.model;
        }
        if self.prompt_template.is_some() {
            config.prompt_template_path = self.prompt_template;
        }
        config
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);
    let skip_startup = cli.skip_startup;
    let config = cli.apply(Config::from_env());

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.http_port,
        repository = %config.repository_path.display(),
        workspaces = %config.workspace_base_dir.display(),
        agent = %config.agent_executable,
        "Starting agent orchestrator"
    );

    let credentials = config.credential_source();
    if !credentials.is_configured() {
        anyhow::bail!(
            "no Linear credentials: set LINEAR_OAUTH_TOKEN_FILE, LINEAR_API_KEY or LINEAR_PERSONAL_ACCESS_TOKEN"
        );
    }
    if config.webhook_secret.is_none() {
        warn!("LINEAR_WEBHOOK_SECRET is not set; webhook signatures are not verified");
    }

    let orchestrator = Orchestrator::new(build_context(&config, credentials)?);
    let shutdown = CancellationToken::new();

    if skip_startup {
        info!("Skipping startup pickup of assigned issues");
    } else if let Err(e) = orchestrator.startup().await {
        warn!(error = %e, "Startup pickup failed; continuing with webhooks only");
    }

    let gc = orchestrator.spawn_gc(config.gc_interval(), config.gc_retention(), shutdown.clone());

    let router = build_router(ServerState {
        orchestrator: orchestrator.clone(),
        webhook_secret: config.webhook_secret.clone(),
        webhook_max_age_ms: config.webhook_max_age_ms,
        shutdown: shutdown.clone(),
    });

    let addr = format!("0.0.0.0:{}", config.http_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(addr = %addr, "Webhook server listening");

    let token = shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            token.cancel();
        })
        .await
        .context("webhook server failed")?;

    shutdown.cancel();
    gc.await.ok();
    orchestrator.shutdown().await;
    info!("Agent orchestrator stopped");
    Ok(())
}

fn build_context(config: &Config, credentials: linear::CredentialSource) -> Result<AppContext> {
    let tracker =
        Arc::new(AuthenticatedClient::new(credentials).with_api_url(&config.linear_api_url));

    let provisioner = Arc::new(
        GitWorktreeProvisioner::new(&config.repository_path, &config.workspace_base_dir)
            .with_main_branch(&config.main_branch)
            .with_setup_script(&config.setup_script),
    );

    let mut backend = ClaudeCliBackend::new(&config.agent_executable);
    if let Some(model) = &config.agent_model {
        backend = backend.with_model(model);
    }
    let agent = AgentSettings::new(Arc::new(backend))
        .with_allowed_tools(config.allowed_tools.clone())
        .with_max_turns(config.max_turns)
        .with_logs_dir(&config.logs_dir);

    let mut ctx = AppContext::new(tracker, provisioner, agent)?
        .with_state_store(StateStore::new(&config.state_file));

    if let Some(path) = &config.prompt_template_path {
        ctx = ctx.with_prompts(PromptBuilder::from_file(path)?);
        info!(path = %path.display(), "Using custom prompt template");
    }
    if config.download_attachments {
        ctx = ctx.with_attachments(AttachmentDownloader::new()?);
    }
    if let Some(user_id) = &config.agent_user_id {
        ctx = ctx.with_agent_user_id(user_id);
    }
    Ok(ctx)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down gracefully"),
        () = terminate => info!("Received SIGTERM, shutting down gracefully"),
    }
}
