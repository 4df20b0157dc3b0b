//! Identity transaction engine service
//!
//! Connects every configured chain, exposes Prometheus metrics and keeps a
//! periodic health check running until shutdown.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use identity_tx_engine::chain::ChainManager;
use identity_tx_engine::config::Settings;
use identity_tx_engine::metrics::MetricsServer;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting identity transaction engine v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );

    let chain_manager = Arc::new(ChainManager::connect(&settings).await?);
    info!("Chain connections initialized: {:?}", chain_manager.connected_chains());

    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    let health_handle = tokio::spawn({
        let chain_manager = chain_manager.clone();
        let interval = settings.engine.health_check_interval_secs;
        async move {
            loop {
                for (chain, healthy) in chain_manager.health_check().await {
                    if !healthy {
                        warn!("Chain {} health check failed", chain);
                    }
                }
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;
            }
        }
    });

    info!("Identity transaction engine is running");
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    shutdown_signal().await;
    info!("Shutdown signal received, stopping...");

    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Identity transaction engine stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,identity_tx_engine=debug,hyper=warn,reqwest=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
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
