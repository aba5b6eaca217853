//! CloudStack cloud controller manager
//!
//! Watches Services and Nodes and keeps CloudStack load balancers in
//! sync with the cluster.
//!
//! ## Usage
//!
//! ```bash
//! # Run the controller (requires kubeconfig)
//! cloudstack-ccm --cloud-config /etc/kubernetes/cloudstack.toml
//!
//! # Run with custom log level
//! RUST_LOG=debug cloudstack-ccm --cloud-config ./cloudstack.toml
//! ```

use clap::Parser;
use cloudstack_ccm::events::KubeEventSink;
use cloudstack_ccm::leader_election::{self, LeaderElector};
use cloudstack_ccm::watch::{run_node_watcher, run_service_watcher, EventIntake};
use cloudstack_ccm::{
    config, metrics, CloudStackAdapter, EngineSettings, NodeRegistry, ReconcileQueue, UpdateEngine,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// CloudStack cloud controller manager
#[derive(Parser, Debug)]
#[command(name = "cloudstack-ccm")]
#[command(version, about = "Kubernetes cloud controller manager for CloudStack")]
struct Args {
    /// Path to the cloud configuration file
    #[arg(long, default_value = "/etc/kubernetes/cloudstack.toml")]
    cloud_config: std::path::PathBuf,

    /// Enable leader election for HA deployments
    #[arg(long, default_value = "false")]
    leader_election: bool,

    /// Namespace for the leader election Lease (auto-detected if empty)
    #[arg(long, default_value = "")]
    leader_election_namespace: String,

    /// Metrics bind address
    #[arg(long, default_value = "0.0.0.0:8080")]
    metrics_bind_address: String,

    /// Override the configured number of update workers
    #[arg(long)]
    update_lb_workers: Option<usize>,

    /// Seconds to wait for the queue to drain on shutdown
    #[arg(long, default_value = "30")]
    shutdown_grace_seconds: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let args = Args::parse();

    info!("Starting CloudStack cloud controller manager");
    info!("Leader election: {}", args.leader_election);

    let cfg = config::load_config(&args.cloud_config)?;
    info!(
        "Loaded configuration with {} environment(s)",
        cfg.environment.len()
    );

    let metrics_addr: SocketAddr = args.metrics_bind_address.parse()?;
    metrics::install_prometheus_exporter(metrics_addr)?;
    info!("Serving metrics on {}", metrics_addr);

    // Create Kubernetes client
    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    // Leader election — acquire lease before starting the engine
    let elector = if args.leader_election {
        let ns = leader_election::detect_namespace(&args.leader_election_namespace);
        info!("Leader election namespace: {}", ns);
        let elector = LeaderElector::new(client.clone(), &ns);
        elector.acquire().await?;
        Some(Arc::new(elector))
    } else {
        None
    };

    // Assemble the engine
    let registry = Arc::new(NodeRegistry::new(cfg.global.clone()));
    let queue = Arc::new(ReconcileQueue::new(Arc::clone(&registry)));
    let adapter = Arc::new(CloudStackAdapter::from_config(&cfg)?);
    let events = Arc::new(KubeEventSink::new(client.clone()));
    let settings = EngineSettings {
        workers: args.update_lb_workers.unwrap_or_else(|| cfg.global.workers()),
        ..Default::default()
    };
    let engine = Arc::new(UpdateEngine::new(
        Arc::clone(&registry),
        Arc::clone(&queue),
        adapter,
        events,
        settings,
    ));

    // Worker cancellation is tripped only if the drain times out; watch
    // cancellation is tripped first so no new work arrives during drain.
    let (engine_cancel_tx, engine_cancel_rx) = watch::channel(false);
    let (watch_cancel_tx, watch_cancel_rx) = watch::channel(false);

    let engine_handle = engine.start(engine_cancel_rx);

    let intake = Arc::new(EventIntake::new(
        Arc::clone(&registry),
        Arc::clone(&queue),
        cfg.global.clone(),
    ));
    let service_watch = tokio::spawn(run_service_watcher(
        client.clone(),
        Arc::clone(&intake),
        watch_cancel_rx.clone(),
    ));
    let node_watch = tokio::spawn(run_node_watcher(
        client.clone(),
        Arc::clone(&intake),
        watch_cancel_rx.clone(),
    ));

    // Periodic lease renewal (no-op future when leader election is disabled)
    let elector_for_renew = elector.clone();
    let renew_handle = tokio::spawn(async move {
        match elector_for_renew {
            Some(e) => loop {
                tokio::time::sleep(e.renew_interval()).await;
                match e.renew().await {
                    Ok(true) => {}
                    Ok(false) => {
                        error!("Lost leader lease");
                        break;
                    }
                    Err(err) => {
                        error!("Failed to renew leader lease: {}", err);
                        break;
                    }
                }
            },
            None => std::future::pending::<()>().await,
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = service_watch => {
            if let Err(e) = result {
                error!("Service watcher task failed: {}", e);
            }
        }
        result = node_watch => {
            if let Err(e) = result {
                error!("Node watcher task failed: {}", e);
            }
        }
        _ = renew_handle => {
            error!("Leader lease lost, initiating shutdown");
        }
    }

    // Two-phase shutdown: stop intake, drain the workers, and cancel them
    // outright if the drain exceeds the grace period.
    let _ = watch_cancel_tx.send(true);
    let shutdown = engine_handle.shutdown();
    tokio::pin!(shutdown);
    if tokio::time::timeout(
        Duration::from_secs(args.shutdown_grace_seconds),
        &mut shutdown,
    )
    .await
    .is_err()
    {
        error!("Queue drain timed out, cancelling update workers");
        let _ = engine_cancel_tx.send(true);
        shutdown.await;
    }

    // Release the lease before exiting so a standby replica can take over
    if let Some(e) = &elector {
        e.release().await;
    }

    info!("CloudStack cloud controller manager shutting down");
    Ok(())
}
