use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::router::{build_router_with_state, AppState};
use chat_gateway_authorization::{CibaClient, CibaConfig};
use chat_gateway_remote::{RemoteGateway, RemoteGatewayConfig};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 2470;

#[derive(Parser, Debug)]
#[command(name = "chat-gateway", bin_name = "chat-gateway")]
#[command(about = "Gateway between chat clients and a remote multi-agent execution service")]
#[command(version, arg_required_else_help = true)]
pub struct ChatGatewayCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat gateway HTTP server.
    Server(ServerArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,

    #[arg(long = "cors-allow-method", short = 'M')]
    cors_allow_method: Vec<String>,

    #[arg(long = "cors-allow-header", short = 'A')]
    cors_allow_header: Vec<String>,

    #[arg(long = "cors-allow-credentials", short = 'C')]
    cors_allow_credentials: bool,

    #[command(flatten)]
    gateway: GatewayOptions,
}

#[derive(Args, Debug)]
pub struct GatewayOptions {
    /// Base URL of the remote execution service.
    #[arg(long = "remote-url", env = "CHAT_GATEWAY_REMOTE_URL")]
    remote_url: String,

    #[arg(long = "max-retries", env = "CHAT_GATEWAY_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    #[arg(
        long = "retry-base-delay-ms",
        env = "CHAT_GATEWAY_RETRY_BASE_DELAY_MS",
        default_value_t = 1000
    )]
    retry_base_delay_ms: u64,

    #[arg(
        long = "thread-ttl-secs",
        env = "CHAT_GATEWAY_THREAD_TTL_SECS",
        default_value_t = 3600
    )]
    thread_ttl_secs: u64,

    /// OpenID issuer for backchannel authorization. The purchase flow stays
    /// disabled unless issuer, client id and client secret are all present.
    #[arg(long = "auth-issuer", env = "CHAT_GATEWAY_AUTH_ISSUER")]
    auth_issuer: Option<String>,

    #[arg(long = "auth-client-id", env = "CHAT_GATEWAY_AUTH_CLIENT_ID")]
    auth_client_id: Option<String>,

    #[arg(long = "auth-client-secret", env = "CHAT_GATEWAY_AUTH_CLIENT_SECRET")]
    auth_client_secret: Option<String>,

    #[arg(long = "auth-audience", env = "CHAT_GATEWAY_AUTH_AUDIENCE")]
    auth_audience: Option<String>,

    #[arg(long = "auth-scope", env = "CHAT_GATEWAY_AUTH_SCOPE")]
    auth_scope: Option<String>,

    #[arg(long = "auth-max-polls", env = "CHAT_GATEWAY_AUTH_MAX_POLLS")]
    auth_max_polls: Option<u32>,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("invalid cors method: {0}")]
    InvalidCorsMethod(String),
    #[error("invalid cors header: {0}")]
    InvalidCorsHeader(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run_chat_gateway() -> Result<(), CliError> {
    let cli = ChatGatewayCli::parse();
    init_logging();
    match cli.command {
        Command::Server(args) => run_server(&args),
    }
}

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}

fn run_server(server: &ServerArgs) -> Result<(), CliError> {
    let gateway = RemoteGateway::new(remote_config(&server.gateway));
    let ciba = ciba_client(&server.gateway);
    if ciba.is_none() {
        tracing::info!("backchannel authorization not configured; purchase flow disabled");
    }

    let state = Arc::new(AppState::new(gateway, ciba));
    let (mut router, _state) = build_router_with_state(state);

    let cors = build_cors_layer(server)?;
    router = router.layer(cors);

    let addr = format!("{}:{}", server.host, server.port);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "server listening");
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn remote_config(options: &GatewayOptions) -> RemoteGatewayConfig {
    let mut config = RemoteGatewayConfig::new(&options.remote_url);
    config.max_retries = options.max_retries;
    config.retry_base_delay = Duration::from_millis(options.retry_base_delay_ms);
    config.thread_ttl = Duration::from_secs(options.thread_ttl_secs);
    config
}

fn ciba_client(options: &GatewayOptions) -> Option<CibaClient> {
    let issuer = options.auth_issuer.as_deref()?;
    let client_id = options.auth_client_id.as_deref()?;
    let client_secret = options.auth_client_secret.as_deref()?;

    let mut config = CibaConfig::new(issuer, client_id, client_secret);
    config.audience = options.auth_audience.clone();
    if let Some(scope) = options.auth_scope.clone() {
        config.scope = scope;
    }
    if let Some(max_polls) = options.auth_max_polls {
        config.max_poll_attempts = max_polls;
    }
    Some(CibaClient::new(config))
}

fn build_cors_layer(server: &ServerArgs) -> Result<CorsLayer, CliError> {
    let mut cors = CorsLayer::new();

    let mut origins = Vec::new();
    for origin in &server.cors_allow_origin {
        let value = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }
    if origins.is_empty() {
        cors = cors.allow_origin(tower_http::cors::AllowOrigin::predicate(|_, _| false));
    } else {
        cors = cors.allow_origin(origins);
    }

    if server.cors_allow_method.is_empty() {
        cors = cors.allow_methods(Any);
    } else {
        let mut methods = Vec::new();
        for method in &server.cors_allow_method {
            let parsed = method
                .parse()
                .map_err(|_| CliError::InvalidCorsMethod(method.clone()))?;
            methods.push(parsed);
        }
        cors = cors.allow_methods(methods);
    }

    if server.cors_allow_header.is_empty() {
        cors = cors.allow_headers(Any);
    } else {
        let mut headers = Vec::new();
        for header in &server.cors_allow_header {
            let parsed = header
                .parse()
                .map_err(|_| CliError::InvalidCorsHeader(header.clone()))?;
            headers.push(parsed);
        }
        cors = cors.allow_headers(headers);
    }

    if server.cors_allow_credentials {
        cors = cors.allow_credentials(true);
    }

    Ok(cors)
}
