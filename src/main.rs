//! HTLC Swap Coordinator - cross-chain atomic swaps over hashed-timelock escrows
//!
//! Loads the deployment configuration, probes the configured chains, serves
//! Prometheus metrics and runs a rehearsal swap on simulated ledgers to check
//! the timelock and escrow parameters end to end.

use anyhow::Result;
use futures::future::join_all;
use tokio::signal;
use tracing::{error, info, warn};

use htlc_swap_coordinator::chain::ChainProvider;
use htlc_swap_coordinator::config::{ChainSettings, Settings};
use htlc_swap_coordinator::metrics::{self, MetricsServer};
use htlc_swap_coordinator::rehearsal;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting HTLC Swap Coordinator v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration: {} ({}) -> {} ({})",
        settings.chains.source.name,
        settings.chains.source.chain_id,
        settings.chains.destination.name,
        settings.chains.destination.chain_id
    );

    // Start metrics server
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

    // Probe configured chains
    join_all([
        probe_chain(&settings.chains.source),
        probe_chain(&settings.chains.destination),
    ])
    .await;

    // Rehearse one partially filled swap
    let report = rehearsal::run(&settings).await?;
    info!(
        "Rehearsal finished: order {} {} with {} fills",
        report.order_id,
        report.order_state,
        report.fills.len()
    );
    println!("{}", serde_json::to_string_pretty(&report)?);

    if let Some(handle) = metrics_handle {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);

        // Wait for shutdown signal
        shutdown_signal().await;
        info!("Shutdown signal received, stopping...");
        handle.abort();
    }

    info!("HTLC Swap Coordinator stopped");
    Ok(())
}

async fn probe_chain(chain: &ChainSettings) {
    if chain.rpc_urls.is_empty() {
        info!("Chain {} has no RPC endpoints, skipping probe", chain.name);
        return;
    }

    let provider = match ChainProvider::new(chain.clone()) {
        Ok(provider) => provider,
        Err(e) => {
            warn!("Chain {} provider setup failed: {}", chain.name, e);
            metrics::record_chain_health(chain.chain_id, false);
            return;
        }
    };

    let healthy = provider.health_check().await;
    metrics::record_chain_health(chain.chain_id, healthy);
    if !healthy {
        warn!("Chain {} health check failed", chain.name);
        return;
    }

    match provider.latest_block_time().await {
        Ok((height, timestamp)) => {
            metrics::record_block_height(chain.chain_id, height);
            info!(
                "Chain {} at block {} (timestamp {}, {} confirmations required)",
                provider.name(),
                height,
                timestamp,
                provider.confirmation_blocks()
            );
        }
        Err(e) => warn!("Chain {} block time unavailable: {}", chain.name, e),
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,htlc_swap_coordinator=debug,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
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
