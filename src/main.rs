use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use snigate::{
    admin::{AdminApi, AdminServer},
    config::{watch_config_async, ConfigStore},
    events::EventBus,
    metrics, Config, Engine,
};

#[derive(Parser, Debug)]
#[command(name = "snigate")]
#[command(about = "SNI-aware layer-4 reverse proxy")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "snigate.json")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = if args.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    if args.validate {
        Config::load(&args.config)?;
        info!("Configuration is valid");
        return Ok(());
    }

    info!("Loading configuration from {:?}", args.config);
    let store = Arc::new(ConfigStore::open(&args.config)?);
    let config = store.get();

    // Start metrics server if configured
    if let Some(metrics_config) = &config.metrics {
        info!(
            "Starting Prometheus metrics server on {}",
            metrics_config.address
        );
        if let Err(e) = metrics::start_metrics_server(&metrics_config.address) {
            warn!(
                "Failed to start metrics server: {}. Continuing without metrics.",
                e
            );
        }
    }

    let events = EventBus::new();
    let engine = Arc::new(Engine::new(Arc::clone(&store), events.clone()));

    if config.reverse_proxy.disable {
        info!("Reverse proxy is disabled; waiting for it to be enabled via the API");
    } else if let Err(e) = engine.start().await {
        error!("Proxy engine failed to start: {}", e);
    }

    let admin_addr: SocketAddr = config
        .admin
        .address
        .parse()
        .with_context(|| format!("Invalid admin address: {}", config.admin.address))?;
    let api = AdminApi::new(Arc::clone(&store), Arc::clone(&engine), events.clone());
    let admin = AdminServer::new(api, admin_addr);
    tokio::spawn(async move {
        if let Err(e) = admin.run().await {
            error!("Management server error: {}", e);
        }
    });

    // Config watcher: external edits go through the same reconcile path as
    // API mutations.
    let watch_path = args.config.to_string_lossy().to_string();
    let watch_store = Arc::clone(&store);
    let watch_engine = Arc::clone(&engine);
    let watcher_handle = tokio::spawn(async move {
        let (mut rx, _handle) = watch_config_async(watch_path).await;

        while let Ok(new_config) = rx.recv().await {
            info!("Hot reloading configuration...");
            watch_store.replace(new_config);
            if let Err(e) = watch_engine.reconcile().await {
                warn!("Reconcile after reload failed: {}", e);
            }
        }
    });

    info!("snigate started, waiting for shutdown signal");
    shutdown_signal().await;
    info!("Shutdown signal received, stopping");

    watcher_handle.abort();
    engine.stop().await;

    info!("Stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
