use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use pushroute_cluster::sync::{default_offline_push, PushCluster};
use pushroute_core::{bootstrap::load_config, logging};

/// Push-event router for real-time worker fleets
#[derive(Debug, Parser)]
#[command(name = "pushroute", version)]
struct Args {
    /// Path to a TOML config file
    #[arg(long, env = "PUSHROUTE_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load and validate configuration
    let config = load_config(args.config.as_deref())?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("pushroute starting...");

    // 3. Build the cluster
    let cluster = if config.is_single_node() {
        info!("Redis not configured, running single-node");
        let (cluster, _store) = PushCluster::in_memory(&config, |on_error| {
            default_offline_push(config.apns.as_ref(), on_error)
        })
        .context("Failed to start single-node cluster")?;
        cluster
    } else {
        PushCluster::connect(&config)
            .await
            .with_context(|| format!("Failed to connect to Redis at {}", config.redis.url))?
    };

    info!(
        heartbeat_channel = %config.cluster.heartbeat_channel,
        route_channel_prefix = %config.cluster.route_channel_prefix,
        stale_after_ms = config.cluster.stale_after_ms,
        apns = config.apns.is_some(),
        "pushroute ready"
    );

    // 4. Run until signalled
    shutdown_signal().await;
    info!("Shutdown signal received, starting graceful shutdown...");

    cluster.shutdown().await;
    info!("pushroute stopped");

    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
