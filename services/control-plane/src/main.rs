//! gluon control plane
//!
//! The control plane is the central coordination service for the fleet. It
//! terminates agent enrollment/heartbeat/config traffic, serves the admin
//! surface, and runs the offline sweep in the background.

use anyhow::Result;
use gluon_control_plane::{
    api, config,
    db::Database,
    ipam,
    state::AppState,
    workers::offline_sweep::{OfflineSweepConfig, OfflineSweepWorker},
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting gluon control plane");
    info!(listen_addr = %config.listen_addr, "Configuration loaded");

    let db = match Database::connect(&config.database).await {
        Ok(db) => {
            info!("Database connection established");
            db
        }
        Err(e) => {
            error!(error = %e, "Failed to connect to database");
            return Err(e.into());
        }
    };

    if config.dev_mode {
        info!("Running database migrations (dev mode)");
        if let Err(e) = db.run_migrations().await {
            error!(error = %e, "Failed to run migrations");
            return Err(e.into());
        }
    }

    let settings = ipam::load_settings(db.pool()).await?;
    ipam::ensure_default_pools(db.pool(), &settings).await?;
    info!("IP pools verified");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let offline_sweep = OfflineSweepWorker::new(
        db.pool().clone(),
        OfflineSweepConfig {
            interval: config.offline_sweep_interval,
            heartbeat_timeout: config.heartbeat_timeout,
        },
    );
    let offline_sweep_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            offline_sweep.run(shutdown_rx).await;
        }
    });

    let state = AppState::new(db, config.admin_token.clone(), config.heartbeat_timeout);
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);
    if let Err(e) = tokio::time::timeout(shutdown_timeout, offline_sweep_handle).await {
        warn!(error = %e, "Offline sweep worker did not shut down in time");
    }

    info!("Control plane shutdown complete");
    Ok(())
}
