//! # butler-daemon
//!
//! HTTP gateway that turns edit batches into GitHub branches, commits, and
//! pull requests.
//!
//! Every mutating request carries `X-Butler-Token`. Paths are checked against
//! an allow-list before anything is written, and edits under
//! `.github/workflows/` additionally require `X-Butler-Approve-Workflows`.
//!
//! ## Usage
//!
//! ```text
//! BUTLER_TOKEN=... GITHUB_APP_ID=... GITHUB_INSTALLATION_ID=... \
//! GITHUB_PRIVATE_KEY="$(cat app.pem)" butler-daemon --bind 0.0.0.0:8787
//! ```

mod api;
mod auth;
mod config;
mod error;
mod plan;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use butler_submit::{GitHubAuth, GitHubClient};
use clap::Parser;
use secrecy::SecretString;
use tracing_subscriber::EnvFilter;

use crate::config::{FileConfig, Secrets, ServerConfig};

/// Butler automation gateway.
#[derive(Parser)]
#[command(name = "butler-daemon", version, about = "Butler automation gateway")]
struct Cli {
    /// Address to listen on.
    #[arg(long, env = "BUTLER_BIND", default_value = "127.0.0.1:8787")]
    bind: SocketAddr,

    /// Path to butler.toml (missing file means defaults).
    #[arg(long, env = "BUTLER_CONFIG", default_value = "butler.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long, env = "BUTLER_LOG_JSON")]
    log_json: bool,

    /// Shared secret callers present in X-Butler-Token.
    #[arg(long, env = "BUTLER_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Secret that unlocks edits under .github/workflows/.
    #[arg(long, env = "BUTLER_APPROVE_WORKFLOWS_TOKEN", hide_env_values = true)]
    approve_workflows_token: Option<String>,

    #[arg(long, env = "GITHUB_APP_ID")]
    github_app_id: Option<String>,

    #[arg(long, env = "GITHUB_INSTALLATION_ID")]
    github_installation_id: Option<String>,

    /// PEM-encoded app private key. Literal `\n` sequences are accepted.
    #[arg(
        long,
        env = "GITHUB_PRIVATE_KEY",
        hide_env_values = true,
        allow_hyphen_values = true
    )]
    github_private_key: Option<String>,

    #[arg(long, env = "GITHUB_PRIVATE_KEY_PATH")]
    github_private_key_path: Option<PathBuf>,

    /// Static token used instead of app credentials (development only).
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    github_token: Option<String>,

    /// Revision reported by /status.
    #[arg(long, env = "BUTLER_REVISION", default_value = "dev")]
    revision: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json)?;

    let file = FileConfig::load_or_default(&cli.config)?;
    let auth = github_auth(&cli)?;

    let api_token = match cli.token.as_deref().map(str::trim) {
        Some(t) if !t.is_empty() => SecretString::from(t.to_string()),
        _ => bail!("BUTLER_TOKEN must be set"),
    };
    let workflow_approval = cli
        .approve_workflows_token
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| SecretString::from(t.to_string()));
    if workflow_approval.is_none() {
        tracing::warn!("BUTLER_APPROVE_WORKFLOWS_TOKEN unset; workflow edits are blocked");
    }

    let config = ServerConfig {
        server: file.server,
        github: file.github,
        secrets: Secrets {
            api_token,
            workflow_approval,
        },
        revision: cli.revision.clone(),
    };

    let client = GitHubClient::new(config.github.clone(), auth)?;
    tracing::info!("GitHub API at {}", config.github.api_base_url);
    tracing::info!("allowed paths: {:?}", config.server.allowed_paths);

    let state = api::AppState::new(config, Arc::new(client))?;
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(cli.bind)
        .await
        .with_context(|| format!("failed to bind {}", cli.bind))?;
    tracing::info!("butler gateway listening on {}", cli.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .inspect_err(|e| tracing::error!("server error: {:?}", e))?;

    tracing::info!("butler gateway shutting down");
    Ok(())
}

fn init_tracing(json: bool) -> Result<()> {
    // Logs go to stderr; stdout is left to the process supervisor.
    let filter = EnvFilter::from_default_env()
        .add_directive("butler_daemon=info".parse()?)
        .add_directive("butler_submit=info".parse()?)
        .add_directive("butler_policy=info".parse()?);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.with_ansi(false).init();
    }
    Ok(())
}

/// App credentials take precedence over a static token.
fn github_auth(cli: &Cli) -> Result<GitHubAuth> {
    if let (Some(app_id), Some(installation_id)) = (&cli.github_app_id, &cli.github_installation_id)
    {
        let pem = match (&cli.github_private_key, &cli.github_private_key_path) {
            (Some(inline), _) => inline.replace("\\n", "\n"),
            (None, Some(path)) => std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?,
            (None, None) => {
                bail!("GITHUB_PRIVATE_KEY or GITHUB_PRIVATE_KEY_PATH is required with GITHUB_APP_ID")
            }
        };
        tracing::info!("authenticating as GitHub App {} (installation {})", app_id, installation_id);
        return Ok(GitHubAuth::App {
            app_id: app_id.clone(),
            installation_id: installation_id.clone(),
            private_key: SecretString::from(pem),
        });
    }

    match &cli.github_token {
        Some(token) if !token.trim().is_empty() => {
            tracing::warn!("using static GITHUB_TOKEN; prefer app credentials in production");
            Ok(GitHubAuth::Token(SecretString::from(token.trim().to_string())))
        }
        _ => bail!("set GITHUB_APP_ID, GITHUB_INSTALLATION_ID and GITHUB_PRIVATE_KEY, or GITHUB_TOKEN"),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
