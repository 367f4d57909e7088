//! gluon node agent
//!
//! Runs on every fleet machine. Enrolls once, then loops forever:
//! heartbeating and dispatching admin commands, reconciling WireGuard/FRR/SSH
//! state, and arbitrating the node's role in the Kubernetes cluster.

use std::time::Duration;

use anyhow::Result;
use gluon_node_agent::{config::Config, enroll, heartbeat, kubernetes::KubernetesAgent, reconciler::Reconciler, ControlPlaneClient};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let mut config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting gluon node agent");
    info!(control_plane_url = %config.control_plane_url, hostname = %config.hostname, "configuration loaded");

    let mut client = ControlPlaneClient::new(&config);

    enroll::ensure_enrolled(&mut config, &mut client).await?;
    info!(node_id = ?config.enrollment.node_id, "enrollment complete");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let heartbeat_interval = Duration::from_secs(config.heartbeat_interval_secs);
    let heartbeat_client = ControlPlaneClient::new(&config);
    let heartbeat_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            heartbeat::run(&heartbeat_client, heartbeat_interval, shutdown_rx).await;
        }
    });

    let reconciler = Reconciler::new(config.data_dir.clone());
    let reconciler_client = ControlPlaneClient::new(&config);
    let reconciler_handle = tokio::spawn({
        let mut shutdown_rx = shutdown_rx.clone();
        async move {
            run_reconcile_loop(&reconciler, &reconciler_client, &mut shutdown_rx).await;
        }
    });

    let kubernetes_client = ControlPlaneClient::new(&config);
    let kubernetes_handle = tokio::spawn({
        let mut shutdown_rx = shutdown_rx.clone();
        async move {
            run_kubernetes_loop(&kubernetes_client, &mut shutdown_rx).await;
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
        result = heartbeat_handle => {
            if let Err(e) = result {
                error!(error = %e, "heartbeat task panicked");
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("waiting for workers to shut down...");
    let shutdown_timeout = Duration::from_secs(10);
    if tokio::time::timeout(shutdown_timeout, reconciler_handle).await.is_err() {
        warn!("reconciler loop did not shut down in time");
    }
    if tokio::time::timeout(shutdown_timeout, kubernetes_handle).await.is_err() {
        warn!("kubernetes loop did not shut down in time");
    }

    info!("node agent shutdown complete");
    Ok(())
}

async fn run_reconcile_loop(reconciler: &Reconciler, client: &ControlPlaneClient, shutdown: &mut watch::Receiver<bool>) {
    const RECONCILE_INTERVAL: Duration = Duration::from_secs(60);
    info!("starting config reconcile loop");
    let mut ticker = tokio::time::interval(RECONCILE_INTERVAL);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = reconciler.reconcile_once(client).await {
                    warn!(error = %e, "config reconcile pass failed");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("config reconcile loop shutting down");
                    break;
                }
            }
        }
    }
}

async fn run_kubernetes_loop(client: &ControlPlaneClient, shutdown: &mut watch::Receiver<bool>) {
    const SYNC_INTERVAL: Duration = Duration::from_secs(30);
    info!("starting kubernetes sync loop");
    let mut agent = KubernetesAgent::new();
    let mut ticker = tokio::time::interval(SYNC_INTERVAL);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = agent.sync(client).await {
                    warn!(error = %e, "kubernetes sync pass failed");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("kubernetes sync loop shutting down");
                    break;
                }
            }
        }
    }
}
