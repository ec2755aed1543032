use std::io::Write;
use std::sync::Arc;

use axum::http::HeaderValue;
use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use utoipa::OpenApi;

use crate::config::CompanionConfig;
use crate::launcher::{BackendCommand, LauncherConfig};
use crate::logging::init_logging;
use crate::router::{build_router_with_state, shutdown, ApiDoc, AppState};
use crate::terminal::{default_shell, TerminalConfig};
use crate::usage::UsageConfig;

const DEFAULT_PORT: u16 = 3457;

#[derive(Parser, Debug)]
#[command(name = "agent-companion")]
#[command(about = "Drive coding-agent CLIs and terminals over HTTP and WebSocket", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP/WebSocket server
    Server(ServerArgs),
    /// Print the OpenAPI document
    Openapi,
}

#[derive(Args, Debug)]
struct ServerArgs {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Claude CLI executable [env: AGENT_COMPANION_CLAUDE_BIN]
    #[arg(long = "claude-bin")]
    claude_bin: Option<String>,

    /// Extra leading argument for the Claude CLI (repeatable)
    #[arg(long = "claude-arg")]
    claude_args: Vec<String>,

    /// Codex CLI executable [env: AGENT_COMPANION_CODEX_BIN]
    #[arg(long = "codex-bin")]
    codex_bin: Option<String>,

    /// Extra leading argument for the Codex CLI (repeatable)
    #[arg(long = "codex-arg")]
    codex_args: Vec<String>,

    /// Container runtime used for container terminals [env: AGENT_COMPANION_CONTAINER_RUNTIME]
    #[arg(long = "container-runtime")]
    container_runtime: Option<String>,

    /// Shell for host terminals (defaults to $SHELL, then /bin/bash)
    #[arg(long = "terminal-shell")]
    terminal_shell: Option<String>,

    /// Shell started inside containers
    #[arg(long = "container-shell")]
    container_shell: Option<String>,

    /// OAuth token for Anthropic account usage [env: AGENT_COMPANION_ANTHROPIC_OAUTH_TOKEN]
    #[arg(long = "anthropic-oauth-token")]
    anthropic_oauth_token: Option<String>,

    #[arg(long = "cors-allow-origin")]
    cors_allow_origin: Vec<String>,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run_agent_companion() -> Result<(), CliError> {
    let cli = Cli::parse();
    init_logging();

    match cli.command {
        Command::Server(args) => run_server(args),
        Command::Openapi => {
            let json = serde_json::to_string_pretty(&ApiDoc::openapi())?;
            let mut out = std::io::stdout();
            out.write_all(json.as_bytes())?;
            out.write_all(b"\n")?;
            Ok(())
        }
    }
}

fn run_server(args: ServerArgs) -> Result<(), CliError> {
    let cors = build_cors_layer(&args)?;
    let addr = format!("{}:{}", args.host, args.port);
    let config = build_config(args);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let (mut router, state) = build_router_with_state(Arc::new(AppState::new(config)));
        if let Some(cors) = cors {
            router = router.layer(cors);
        }

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "agent-companion listening");
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|err| CliError::Server(err.to_string()))?;

        tracing::info!("shutting down sessions and terminals");
        shutdown(&state).await;
        Ok::<(), CliError>(())
    })
}

fn build_config(args: ServerArgs) -> CompanionConfig {
    let claude = BackendCommand::new(
        flag_or_env(args.claude_bin, "AGENT_COMPANION_CLAUDE_BIN")
            .unwrap_or_else(|| "claude".to_string()),
    )
    .with_prefix_args(args.claude_args);
    let codex = BackendCommand::new(
        flag_or_env(args.codex_bin, "AGENT_COMPANION_CODEX_BIN")
            .unwrap_or_else(|| "codex".to_string()),
    )
    .with_prefix_args(args.codex_args);

    let defaults = TerminalConfig::default();
    let terminal = TerminalConfig {
        shell: args.terminal_shell.unwrap_or_else(default_shell),
        container_runtime: flag_or_env(args.container_runtime, "AGENT_COMPANION_CONTAINER_RUNTIME")
            .unwrap_or(defaults.container_runtime),
        container_shell: args.container_shell.unwrap_or(defaults.container_shell),
    };

    let usage = UsageConfig {
        anthropic_oauth_token: flag_or_env(
            args.anthropic_oauth_token,
            "AGENT_COMPANION_ANTHROPIC_OAUTH_TOKEN",
        ),
        ..UsageConfig::default()
    };

    CompanionConfig {
        launcher: LauncherConfig {
            claude,
            codex,
            ..LauncherConfig::default()
        },
        terminal,
        usage,
    }
}

fn flag_or_env(flag: Option<String>, key: &str) -> Option<String> {
    flag.or_else(|| std::env::var(key).ok())
        .filter(|value| !value.trim().is_empty())
}

fn build_cors_layer(args: &ServerArgs) -> Result<Option<CorsLayer>, CliError> {
    if args.cors_allow_origin.is_empty() {
        return Ok(None);
    }
    let mut origins = Vec::new();
    for origin in &args.cors_allow_origin {
        let value: HeaderValue = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }
    Ok(Some(
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any),
    ))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
