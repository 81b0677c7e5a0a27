use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use bulwark::config::{BulwarkConfig, LogFormat, LoggingConfig, StoreBackend, StoreConfig};
use bulwark::http::HttpServer;
use bulwark::ratelimit::{RateLimitEngine, RuleSet, SweepScheduler};
use bulwark::store::{CounterStore, MemoryCounterStore, RedisCounterStore};

/// Rate limiting and abuse detection service.
#[derive(Debug, Parser)]
#[command(name = "bulwark", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the HTTP listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = BulwarkConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }

    init_tracing(&config.logging);

    info!("Starting Bulwark Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        listen_addr = %config.server.listen_addr,
        store = ?config.store.backend,
        "Configuration loaded"
    );

    let store = build_store(&config.store).await;
    let engine = Arc::new(RateLimitEngine::new(store));
    if let Some(path) = &config.engine.rules_path {
        engine.add_rules(RuleSet::from_file(path)?)?;
        info!(path = %path, "Loaded rules file");
    }
    info!(rules = engine.rules().len(), "Rate limit engine initialized");

    let scheduler = SweepScheduler::spawn(engine.clone(), config.engine.schedule());

    let server = HttpServer::new(config.server.listen_addr, engine);
    let served = server.serve_with_shutdown(shutdown_signal()).await;

    scheduler.shutdown().await;
    served?;

    info!("Bulwark Rate Limiting Service stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

/// Connect the configured store. An unreachable Redis degrades to the
/// in-memory store so the service still starts.
async fn build_store(config: &StoreConfig) -> Arc<dyn CounterStore> {
    match config.backend {
        StoreBackend::Memory => Arc::new(MemoryCounterStore::new()),
        StoreBackend::Redis => match RedisCounterStore::connect(config.redis.clone()).await {
            Ok(store) => {
                info!(url = %config.redis.url, "Connected to Redis counter store");
                Arc::new(store)
            }
            Err(e) => {
                warn!(
                    url = %config.redis.url,
                    error = %e,
                    "Redis unavailable, falling back to in-memory counters"
                );
                Arc::new(MemoryCounterStore::new())
            }
        },
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
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
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
