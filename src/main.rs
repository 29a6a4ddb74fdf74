use anyhow::Context;
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::config::{BackendKind, TollgateConfig};
use tollgate::http::{AppState, HttpServer};
use tollgate::ratelimit::{RateLimiter, Sweeper, WindowBackend, WindowStore};

/// Sliding-window admission control service.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "TOLLGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the HTTP listen address
    #[arg(long, env = "TOLLGATE_LISTEN")]
    listen: Option<SocketAddr>,

    /// Log output format
    #[arg(long, env = "TOLLGATE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Starting Tollgate admission service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Configuration faults abort startup.
    let mut config = match &cli.config {
        Some(path) => TollgateConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => TollgateConfig::default(),
    };
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }
    config.validate()?;

    let registry = config.build_registry()?;
    for policy in registry.iter() {
        info!(
            policy = %policy.name,
            limit = policy.limit,
            window_ms = policy.window_ms,
            on_backend_failure = ?policy.on_backend_failure,
            "Policy registered"
        );
    }

    let backend = build_backend(&config).await?;
    info!(backend = backend.name(), "Window backend initialized");

    let limiter = Arc::new(
        RateLimiter::new(registry)
            .with_backend(backend)
            .with_key_extractor(config.build_key_extractor()?),
    );

    let _sweeper = config
        .sweeper
        .enabled
        .then(|| Sweeper::for_limiter(&limiter, config.sweep_interval()).spawn());

    let state = AppState::from_config(limiter, &config)?;
    let server = HttpServer::new(config.server.listen_addr, state);

    info!("Starting HTTP server on {}", config.server.listen_addr);

    // Run the server with graceful shutdown on Ctrl+C
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Tollgate admission service stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn build_backend(config: &TollgateConfig) -> anyhow::Result<Arc<dyn WindowBackend>> {
    match config.backend.kind {
        BackendKind::Memory => Ok(Arc::new(WindowStore::new())),
        #[cfg(feature = "redis")]
        BackendKind::Redis => {
            let url = config
                .backend
                .redis_url
                .as_deref()
                .context("backend.redis_url is required for the redis backend")?;
            let store =
                tollgate::ratelimit::RedisWindowStore::connect(url, config.backend.key_prefix.clone())
                    .await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis"))]
        BackendKind::Redis => {
            anyhow::bail!("the redis backend requires building with `--features redis`")
        }
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
