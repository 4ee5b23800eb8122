//! Worker binary: runs the worker runtime against one job class.
//!
//! Wires together the resilient store client, the broker, a handler
//! registry, and the shared HTTP health/metrics surface. Job kinds are
//! registered in [`run`]; this binary ships [`handlers::EchoHandler`] as a
//! demonstration kind so the process is runnable and exercisable out of the
//! box. Operators building on this binary register their own handlers
//! alongside it.

pub mod handlers;

use std::sync::Arc;

use broker::{Broker, BrokerConfig, HandlerRegistry, WorkerHealthState, WorkerRuntime};
use broker::store::{FallbackStoreClient, RedisStoreClient, StoreClient};
use core_config::redis::StoreConfig;
use core_config::worker::WorkerConfig;
use core_config::{Environment, FromEnv};
use database::redis::RedisConfig;
use eyre::{Result, WrapErr};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

/// Start the worker's health/readiness/metrics HTTP server.
async fn start_health_server(state: WorkerHealthState, port: u16) -> Result<()> {
    let app = broker::worker_health_router(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("failed to bind health server to {addr}"))?;

    info!(%port, "worker health server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("worker health server failed")?;

    Ok(())
}

/// Connect the resilient store client: a primary Redis-compatible backend,
/// optionally wrapped in a [`FallbackStoreClient`] when a secondary is
/// configured.
async fn connect_store(store_config: &StoreConfig) -> Result<Arc<dyn StoreClient>> {
    let primary_conn = database::redis::connect_from_config_with_retry(
        RedisConfig::new(store_config.url.clone()),
        None,
    )
    .await
    .wrap_err("failed to connect to primary store")?;
    let primary: Arc<dyn StoreClient> = Arc::new(RedisStoreClient::new(primary_conn));

    if !store_config.fallback_enabled {
        return Ok(primary);
    }

    let Some(fallback_url) = &store_config.fallback_url else {
        return Ok(primary);
    };

    let fallback_conn = database::redis::connect_from_config_with_retry(
        RedisConfig::new(fallback_url.clone()),
        None,
    )
    .await
    .wrap_err("failed to connect to fallback store")?;
    let fallback: Arc<dyn StoreClient> = Arc::new(RedisStoreClient::new(fallback_conn));

    Ok(Arc::new(FallbackStoreClient::new(primary, Some(fallback))))
}

/// Run the worker process for the class named by `WORKER_CLASS`.
pub async fn run() -> Result<()> {
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    broker::metrics::init_metrics();

    let name = env!("CARGO_PKG_NAME");
    let version = env!("CARGO_PKG_VERSION");
    info!(name, version, ?environment, "starting worker");

    let worker_config = WorkerConfig::from_env().wrap_err("failed to load worker configuration")?;

    let store_config = StoreConfig::from_env().wrap_err("failed to load store configuration")?;
    info!("connecting to store...");
    let store = connect_store(&store_config).await?;
    info!("connected to store");

    let broker_config =
        BrokerConfig::from_env().wrap_err("failed to load broker configuration")?;
    info!(
        class = %broker_config.class,
        stream = %broker_config.stream_name,
        consumer_group = %broker_config.consumer_group,
        consumer_id = %broker_config.consumer_id,
        batch_size = %broker_config.batch_size,
        max_concurrent_jobs = %broker_config.max_concurrent_jobs,
        "broker configuration loaded"
    );

    let registry = HandlerRegistry::new().register(handlers::EchoHandler);

    let brk = Broker::new(Arc::clone(&store), broker_config);
    let runtime = WorkerRuntime::new(brk, Arc::clone(&store), registry);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!(error = %e, "error waiting for shutdown signal");
        }
        let _ = shutdown_tx.send(true);
    });

    let health_state = WorkerHealthState {
        status: runtime.status(),
        worker_id: runtime.worker_id().to_string(),
        class: runtime.class().to_string(),
        store: Arc::clone(&store),
    };
    let health_port = worker_config.health_port;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state, health_port).await {
            error!(error = %e, "worker health server failed");
        }
    });

    info!("worker runtime starting...");
    runtime
        .run(shutdown_rx)
        .await
        .map_err(|e| eyre::eyre!("{e}"))?;

    info!("worker stopped");
    Ok(())
}

/// Waits for SIGINT or SIGTERM.
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down..."),
        _ = terminate => info!("received SIGTERM, shutting down..."),
    }

    Ok(())
}
