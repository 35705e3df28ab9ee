mod cache;
mod config;
mod coordination;
mod error;
mod health;
mod http;
mod metrics;
mod upstream;

#[cfg(test)]
mod testing;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::cache::CacheStore;
use crate::config::Config;
use crate::coordination::{FetchCoordinator, NegativeCache};
use crate::metrics::MetricsRegistry;
use crate::upstream::{Origin, UpstreamClient};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

/// Command-line flags.  Each one overrides the matching config file value.
#[derive(Parser, Debug)]
#[command(name = "pubcache", version, about = "Caching proxy for a pub package repository")]
struct Cli {
    /// Path to an optional YAML configuration file.
    #[arg(short, long, env = "PUBCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Address to bind [default: 0.0.0.0]
    #[arg(long, env = "PUBCACHE_HOST")]
    host: Option<String>,

    /// Port to listen on [default: 8080]
    #[arg(short, long, env = "PUBCACHE_PORT")]
    port: Option<u16>,

    /// Root of the on-disk cache [default: ./packages]
    #[arg(long, env = "PUBCACHE_CACHE_DIR")]
    cache_dir: Option<String>,

    /// Upstream repository base URL [default: https://pub.dev]
    #[arg(long, env = "PUBCACHE_UPSTREAM")]
    upstream: Option<String>,

    /// Externally visible base URL used in rewritten `archive_url`s.
    #[arg(long, env = "PUBCACHE_PUBLIC_URL")]
    public_url: Option<String>,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(ref host) = self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(ref dir) = self.cache_dir {
            config.storage.path = dir.clone();
        }
        if let Some(ref upstream) = self.upstream {
            config.upstream.base_url = upstream.clone();
        }
        if let Some(ref public_url) = self.public_url {
            config.server.public_url = Some(public_url.clone());
        }
    }
}

/// Load the config file (if any), layer CLI overrides on top and validate.
fn build_config(cli: &Cli) -> Result<Config> {
    let mut config = match cli.config {
        Some(ref path) => config::load_config(path)?,
        None => Config::default(),
    };
    cli.apply(&mut config);
    config::validate_config(&config)?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub metrics: MetricsRegistry,
    pub store: Arc<CacheStore>,
    pub coordinator: Arc<FetchCoordinator>,
    /// Where cache misses are fetched from.
    pub origin: Arc<dyn Origin>,
}

impl AppState {
    pub async fn new(config: Config, origin: Arc<dyn Origin>) -> Result<Self> {
        let metrics = MetricsRegistry::new();
        let store = Arc::new(CacheStore::open(&config.storage).await?);
        let negative = NegativeCache::new(Duration::from_secs(config.cache.negative_cache_ttl));
        let coordinator = Arc::new(FetchCoordinator::new(
            Arc::clone(&store),
            negative,
            Arc::clone(&metrics.metrics),
            config.cache.spool_max_bytes,
        ));

        Ok(Self {
            config: Arc::new(config),
            metrics,
            store,
            coordinator,
            origin,
        })
    }
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState) -> Result<()> {
    let host = state.config.server.host.clone();
    let port = state.config.server.port;
    let app = http::handler::create_router(Arc::new(state));

    let listener = tokio::net::TcpListener::bind((host.as_str(), port))
        .await
        .with_context(|| format!("failed to bind HTTP listener on {host}:{port}"))?;

    tracing::info!(addr = %listener.local_addr()?, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
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
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = build_config(&cli)?;

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(
        config_path = ?cli.config,
        upstream = %config.upstream.base_url,
        cache_dir = %config.storage.path,
        "starting pubcache"
    );

    // ---- Upstream ----
    let origin: Arc<dyn Origin> = Arc::new(UpstreamClient::new(&config.upstream)?);

    // ---- App state ----
    let state = AppState::new(config, origin).await?;

    // The rebuilt index may already be over the limit if it was lowered.
    let evicted = state.store.enforce_limits(Path::new("")).await;
    if evicted > 0 {
        tracing::info!(evicted, "startup eviction complete");
    }

    // ---- Serve ----
    run_http_server(state).await?;

    tracing::info!("pubcache shut down cleanly");
    Ok(())
}
