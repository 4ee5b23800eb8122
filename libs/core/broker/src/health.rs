//! HTTP health/metrics/admin surface (§4.D, §4.H), shared by the worker and
//! control-plane binaries. Grounded on this crate's former health-router
//! module: Axum handlers over a small `Clone` state struct, combined into a
//! router via `with_state`.

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::dlq::DlqManager;
use crate::metrics;
use crate::store::StoreClient;
use crate::worker::SharedStatus;

/// Shared state for a worker process's `/health`, `/ready`, `/metrics`.
#[derive(Clone)]
pub struct WorkerHealthState {
    pub status: Arc<SharedStatus>,
    pub worker_id: String,
    pub class: String,
    pub store: Arc<dyn StoreClient>,
}

/// `GET /health` response shape fixed by §6: `{status, state, worker_id,
/// uptime_seconds, resources, timestamp}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub state: String,
    pub worker_id: String,
    pub uptime_seconds: u64,
    pub resources: ResourceSnapshot,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub jobs_processed: u64,
    pub jobs_failed: u64,
}

/// Liveness probe: always 200 once the process is serving HTTP at all.
pub async fn health_handler(State(state): State<WorkerHealthState>) -> Json<HealthResponse> {
    let snapshot = state.status.snapshot();
    Json(HealthResponse {
        status: "ok",
        state: snapshot.state.as_str().to_string(),
        worker_id: state.worker_id,
        uptime_seconds: snapshot.uptime_seconds,
        resources: ResourceSnapshot {
            jobs_processed: snapshot.jobs_processed,
            jobs_failed: snapshot.jobs_failed,
        },
        timestamp: Utc::now(),
    })
}

/// Readiness probe: pings the store, since a worker that cannot reach it
/// cannot make progress even though the process itself is alive.
pub async fn ready_handler(
    State(state): State<WorkerHealthState>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    match state.store.ping().await {
        Ok(()) => Ok((
            StatusCode::OK,
            Json(json!({"status": "ready", "checks": {"store": "ok"}})),
        )),
        Err(e) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "not_ready", "checks": {"store": e.to_string()}})),
        )),
    }
}

/// Prometheus text-format metrics, scraped by the metrics backend.
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::get_metrics_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "metrics not initialized. Call metrics::init_metrics() at startup.".to_string(),
        )
            .into_response(),
    }
}

/// Standard worker HTTP surface: `/health`, `/healthz`, `/ready`, `/readyz`, `/metrics`.
pub fn worker_health_router(state: WorkerHealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// ============================================================================
// Dead-letter admin endpoints (§4.H), bound to one queue's DlqManager.
// Mounted by the control-plane binary once per worker class, nested under
// `/deadletter/{class}`.
// ============================================================================

#[derive(Clone)]
pub struct DlqAdminState {
    pub manager: DlqManager,
    /// Stream a reprocessed job is republished to.
    pub target_stream: String,
}

#[derive(Debug, Deserialize)]
pub struct DlqListParams {
    #[serde(default = "default_limit")]
    pub limit: usize,
    pub start: Option<String>,
}

fn default_limit() -> usize {
    10
}

#[derive(Debug, Deserialize)]
pub struct DlqReprocessParams {
    #[serde(default)]
    pub reset_retry_count: bool,
}

/// `GET /stats`: dead-letter queue depth and ID range.
pub async fn dlq_stats_handler(
    State(state): State<DlqAdminState>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    state
        .manager
        .stats()
        .await
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()}))))
}

/// `GET /messages?limit=&start=`: lists dead-lettered entries.
pub async fn dlq_list_handler(
    State(state): State<DlqAdminState>,
    Query(params): Query<DlqListParams>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    let limit = params.limit.min(100);
    state
        .manager
        .list(limit, params.start.as_deref())
        .await
        .map(|entries| {
            Json(json!({
                "count": entries.len(),
                "entries": entries
                    .into_iter()
                    .map(|(id, entry)| json!({"id": id, "entry": entry}))
                    .collect::<Vec<_>>(),
            }))
        })
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()}))))
}

/// `GET /{id}`: fetches one dead-lettered entry.
pub async fn dlq_get_handler(
    State(state): State<DlqAdminState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    match state.manager.get(&id).await {
        Ok(Some(entry)) => Ok(Json(entry)),
        Ok(None) => Err((StatusCode::NOT_FOUND, Json(json!({"error": "not found", "id": id})))),
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()})))),
    }
}

/// `DELETE /{id}`: permanently discards one entry without reprocessing.
pub async fn dlq_delete_handler(
    State(state): State<DlqAdminState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    match state.manager.delete(&id).await {
        Ok(true) => Ok(Json(json!({"success": true, "id": id}))),
        Ok(false) => Err((StatusCode::NOT_FOUND, Json(json!({"error": "not found", "id": id})))),
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()})))),
    }
}

/// `POST /{id}/reprocess`: republishes one entry onto its live queue. This
/// is the handler behind the orchestrator's `reprocess-deadletter` command.
pub async fn dlq_reprocess_handler(
    State(state): State<DlqAdminState>,
    Path(id): Path<String>,
    Query(params): Query<DlqReprocessParams>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    match state
        .manager
        .reprocess(&id, &state.target_stream, params.reset_retry_count)
        .await
    {
        Ok(Some(new_id)) => Ok(Json(json!({"success": true, "id": id, "new_entry_id": new_id}))),
        Ok(None) => Err((StatusCode::NOT_FOUND, Json(json!({"error": "not found", "id": id})))),
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()})))),
    }
}

/// `DELETE /`: discards every entry. Irreversible; intended for operator use only.
pub async fn dlq_purge_handler(
    State(state): State<DlqAdminState>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    state
        .manager
        .purge()
        .await
        .map(|count| Json(json!({"success": true, "purged": count})))
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()}))))
}

/// Dead-letter admin router for one queue; nest under `/deadletter/{class}`.
pub fn dlq_admin_router(state: DlqAdminState) -> Router {
    Router::new()
        .route("/stats", get(dlq_stats_handler))
        .route("/messages", get(dlq_list_handler))
        .route("/{id}", get(dlq_get_handler))
        .route("/{id}", delete(dlq_delete_handler))
        .route("/{id}/reprocess", post(dlq_reprocess_handler))
        .route("/", delete(dlq_purge_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_response_serializes_with_fixed_shape() {
        let response = HealthResponse {
            status: "ok",
            state: "idle".to_string(),
            worker_id: "worker-1".to_string(),
            uptime_seconds: 42,
            resources: ResourceSnapshot {
                jobs_processed: 5,
                jobs_failed: 1,
            },
            timestamp: Utc::now(),
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"status\":\"ok\""));
        assert!(json.contains("\"worker_id\":\"worker-1\""));
        assert!(json.contains("\"uptime_seconds\":42"));
    }
}
