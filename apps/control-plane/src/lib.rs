//! Control-plane binary: the autoscaler loop (component G) plus the
//! orchestrator HTTP API (component H) that exposes `list-workers`,
//! `scale`, `drain`, and `reprocess-deadletter` as a small axum admin
//! surface, matching the way the worker binary layers routes over a
//! domain service rather than inventing a bespoke RPC transport.

pub mod cli;
pub mod orchestrator;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use broker::store::{FallbackStoreClient, RedisStoreClient, StoreClient};
use core_config::redis::StoreConfig;
use core_config::server::ServerConfig;
use core_config::{env_or_default, Environment, FromEnv};
use database::redis::RedisConfig;
use eyre::{Result, WrapErr};
use scaling::{
    AutoscalerLoop, CloudBackend, CloudFleetSpec, ClusterBackend, ContainerBackend,
    ContainerWorkerSpec, ScalingBackend, ScalingService, WorkerClassConfig,
};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

use crate::cli::{Cli, OrchestratorKind};

/// Connects the resilient store client the same way the worker binary
/// does: a primary backend, optionally wrapped in [`FallbackStoreClient`]
/// when a secondary is configured.
pub async fn connect_store(store_config: &StoreConfig) -> Result<Arc<dyn StoreClient>> {
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

/// Builds the scaling backend named by `--orchestrator`, reading the
/// backend-specific environment variables documented in SPEC_FULL.md §4.E.
pub fn build_backend(kind: OrchestratorKind) -> Arc<dyn ScalingBackend> {
    match kind {
        OrchestratorKind::Container => {
            let spec = ContainerWorkerSpec {
                image: env_or_default("CONTAINER_WORKER_IMAGE", "worker:latest"),
                metrics_port: env_or_default("METRICS_PORT", "9100").parse().unwrap_or(9100),
            };
            let max_replicas = env_or_default("MAX_REPLICAS", "50").parse().unwrap_or(50);
            Arc::new(ContainerBackend::new(spec).with_max_replicas(max_replicas))
        }
        OrchestratorKind::Cluster => {
            let namespace = env_or_default("CLUSTER_NAMESPACE", "default");
            let max_replicas = env_or_default("MAX_REPLICAS", "50").parse().unwrap_or(50);
            Arc::new(ClusterBackend::new(namespace).with_max_replicas(max_replicas))
        }
        OrchestratorKind::Cloud => {
            let spec = CloudFleetSpec {
                cli_binary: env_or_default("CLOUD_CLI_BINARY", "gcloud"),
                subcommand: env_or_default("CLOUD_SUBCOMMAND", "compute,instance-groups,managed")
                    .split(',')
                    .map(str::to_string)
                    .collect(),
                region: env_or_default("REGION", "us-central1"),
            };
            let max_replicas = env_or_default("MAX_REPLICAS", "50").parse().unwrap_or(50);
            Arc::new(CloudBackend::new(spec).with_max_replicas(max_replicas))
        }
    }
}

/// Builds one [`WorkerClassConfig`] per `--class`, applying global
/// defaults from the environment and then a `<CLASS>_*` override for each
/// knob, e.g. `BROWSER_MIN_REPLICAS` overrides `MIN_REPLICAS` for the
/// `browser` class. Not part of the documented environment-variable table
/// (§6 lists only process-wide knobs); recorded as an open-question
/// resolution in DESIGN.md since per-class bounds otherwise have no way
/// to reach the control plane at all.
pub fn class_configs_from_env(classes: &[String]) -> Vec<WorkerClassConfig> {
    classes
        .iter()
        .map(|class| {
            let prefix = class.to_uppercase().replace(['-', '.'], "_");
            let min_replicas = env_u32(&prefix, "MIN_REPLICAS", 0);
            let max_replicas = env_u32(&prefix, "MAX_REPLICAS", 10);
            let scale_up_threshold = env_u64(&prefix, "SCALE_UP_THRESHOLD", 50);
            let scale_down_threshold = env_u64(&prefix, "SCALE_DOWN_THRESHOLD", 5);
            let cooldown_secs = env_u64(&prefix, "COOLDOWN_SECS", 120);
            let step_down = env_u32(&prefix, "STEP_DOWN", 1);

            WorkerClassConfig::new(class.clone())
                .with_replica_bounds(min_replicas, max_replicas)
                .with_thresholds(scale_up_threshold, scale_down_threshold)
                .with_cooldown(Duration::from_secs(cooldown_secs))
                .with_step_down(step_down)
        })
        .collect()
}

fn env_u32(prefix: &str, suffix: &str, default: u32) -> u32 {
    std::env::var(format!("{prefix}_{suffix}"))
        .or_else(|_| std::env::var(suffix))
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(prefix: &str, suffix: &str, default: u64) -> u64 {
    std::env::var(format!("{prefix}_{suffix}"))
        .or_else(|_| std::env::var(suffix))
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Starts the control-plane's own `/health`, `/metrics`, and orchestrator
/// admin HTTP surface.
async fn start_admin_server(state: orchestrator::OrchestratorState, address: String) -> Result<()> {
    let app = orchestrator::orchestrator_router(state);

    let listener = TcpListener::bind(&address)
        .await
        .wrap_err_with(|| format!("failed to bind orchestrator admin server to {address}"))?;

    info!(%address, "orchestrator admin server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("orchestrator admin server failed")?;

    Ok(())
}

/// Runs the control-plane process: connects the store, builds the
/// configured scaling backend, starts the autoscaler loop (§4.G) and the
/// orchestrator admin surface (§4.H), and blocks until shutdown.
pub async fn run(cli: Cli) -> Result<()> {
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);
    broker::metrics::init_metrics();

    let name = env!("CARGO_PKG_NAME");
    let version = env!("CARGO_PKG_VERSION");
    info!(name, version, ?environment, classes = ?cli.classes, "starting control-plane");

    let mut store_config = StoreConfig::from_env().wrap_err("failed to load store configuration")?;
    if let Some(url) = &cli.store_url {
        store_config.url = url.clone();
    }
    if let Some(url) = &cli.fallback_store_url {
        store_config.fallback_url = Some(url.clone());
        store_config.fallback_enabled = true;
    }

    info!("connecting to store...");
    let store = connect_store(&store_config).await?;
    info!("connected to store");

    let backend = build_backend(cli.orchestrator);
    let classes = class_configs_from_env(&cli.classes);
    let service = Arc::new(ScalingService::new(store.clone(), backend.clone()));

    let autoscaler = AutoscalerLoop::new(service, store.clone(), classes.clone())
        .with_check_interval(Duration::from_secs(cli.check_interval));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!(error = %e, "error waiting for shutdown signal");
        }
        let _ = shutdown_tx.send(true);
    });

    let class_configs: HashMap<String, WorkerClassConfig> =
        classes.into_iter().map(|c| (c.class.clone(), c)).collect();
    let admin_state = orchestrator::OrchestratorState { store: store.clone(), backend, class_configs };

    let address = cli.metrics_url.clone().unwrap_or_else(|| {
        ServerConfig::from_env().unwrap_or_default().address()
    });

    let admin_handle = tokio::spawn(async move {
        if let Err(e) = start_admin_server(admin_state, address).await {
            error!(error = %e, "orchestrator admin server failed");
        }
    });

    info!("autoscaler loop starting...");
    autoscaler.run(shutdown_rx).await;

    admin_handle.abort();
    info!("control-plane stopped");
    Ok(())
}

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
