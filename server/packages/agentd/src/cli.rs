use std::io::Write;
use std::path::PathBuf;

use axum::http::HeaderValue;
use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use utoipa::OpenApi;

use crate::config::EngineConfig;
use crate::router::{build_router, ApiDoc, AppState, AuthConfig};
use crate::session::SessionManager;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 2468;

#[derive(Parser, Debug)]
#[command(name = "agentd", bin_name = "agentd")]
#[command(about = "Session and tool-orchestration engine for coding agents", version)]
#[command(arg_required_else_help = true)]
pub struct AgentdCli {
    #[command(subcommand)]
    command: Command,

    /// Bearer token required on every request except /v1/health.
    #[arg(long, short = 't', global = true, env = "AGENTD_TOKEN")]
    token: Option<String>,

    /// Per-user configuration directory (always writable by tools).
    #[arg(long, global = true, env = "AGENTD_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Tool-loop iteration cap when a session does not set maxTurns.
    #[arg(long, global = true, env = "AGENTD_MAX_ITERATIONS")]
    max_iterations: Option<u32>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP server.
    Server(ServerArgs),
    /// Print the tool schema surface offered to backends.
    Tools(ToolsArgs),
    /// Print the OpenAPI document.
    Openapi,
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST, env = "AGENTD_HOST")]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT, env = "AGENTD_PORT")]
    port: u16,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,
}

#[derive(Args, Debug)]
pub struct ToolsArgs {
    /// Workspace whose settings and external tool servers apply.
    #[arg(long, short = 'w')]
    workspace: Option<PathBuf>,
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

pub fn run() -> Result<(), CliError> {
    let cli = AgentdCli::parse();
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    let config = engine_config(&cli);
    match &cli.command {
        Command::Server(args) => run_server(cli.token.clone(), config, args),
        Command::Tools(args) => print_tools(config, args),
        Command::Openapi => write_stdout_line(&ApiDoc::openapi().to_pretty_json()?),
    }
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .try_init()
        .map_err(|err| CliError::Server(err.to_string()))
}

fn engine_config(cli: &AgentdCli) -> EngineConfig {
    let mut config = EngineConfig::from_env();
    if let Some(dir) = &cli.config_dir {
        config.config_dir = dir.clone();
    }
    if let Some(max) = cli.max_iterations {
        config.max_iterations = max.max(1);
    }
    config
}

fn runtime() -> Result<tokio::runtime::Runtime, CliError> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))
}

fn run_server(token: Option<String>, config: EngineConfig, server: &ServerArgs) -> Result<(), CliError> {
    let auth = match token {
        Some(token) => AuthConfig::with_token(token),
        None => AuthConfig::disabled(),
    };
    let addr = format!("{}:{}", server.host, server.port);
    let cors = build_cors_layer(server)?;

    runtime()?.block_on(async move {
        let manager = SessionManager::from_config(&config);
        let router = build_router(AppState::new(auth, manager)).layer(cors);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(
            addr = %addr,
            config_dir = %config.config_dir.display(),
            max_iterations = config.max_iterations,
            "server listening"
        );
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutting down");
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn print_tools(config: EngineConfig, args: &ToolsArgs) -> Result<(), CliError> {
    let workspace = match &args.workspace {
        Some(path) if path.is_absolute() => Some(path.clone()),
        Some(path) => Some(std::env::current_dir()?.join(path)),
        None => None,
    };
    let tools = runtime()?.block_on(async move {
        SessionManager::from_config(&config)
            .tool_schemas(workspace.as_deref())
            .await
    });
    write_stdout_line(&serde_json::to_string_pretty(&tools)?)
}

fn build_cors_layer(server: &ServerArgs) -> Result<CorsLayer, CliError> {
    let mut origins: Vec<HeaderValue> = Vec::new();
    for origin in &server.cors_allow_origin {
        let value = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }
    let cors = if origins.is_empty() {
        CorsLayer::new().allow_origin(tower_http::cors::AllowOrigin::predicate(|_, _| false))
    } else {
        CorsLayer::new().allow_origin(origins)
    };
    Ok(cors.allow_methods(Any).allow_headers(Any))
}

fn write_stdout_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stdout();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_flags_parse() {
        let cli = AgentdCli::try_parse_from([
            "agentd",
            "--max-iterations",
            "3",
            "server",
            "--port",
            "9000",
            "-O",
            "http://localhost:3000",
        ])
        .unwrap();
        assert_eq!(engine_config(&cli).max_iterations, 3);
        let Command::Server(args) = &cli.command else {
            panic!("expected server command");
        };
        assert_eq!(args.port, 9000);
        assert!(build_cors_layer(args).is_ok());
    }

    #[test]
    fn bad_cors_origin_is_rejected() {
        let args = ServerArgs {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            cors_allow_origin: vec!["not a\nheader".to_string()],
        };
        assert!(matches!(
            build_cors_layer(&args),
            Err(CliError::InvalidCorsOrigin(_))
        ));
    }
}
