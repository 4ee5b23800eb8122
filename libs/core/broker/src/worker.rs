//! The worker runtime (§4.D): state machine, handler dispatch, session
//! lifecycle, retry policy, heartbeat, and graceful shutdown.
//!
//! Grounded on this crate's former `StreamWorker<J, P>` loop — ensure group,
//! drain own-pending on startup, periodic reclaim, batch consume, metrics
//! around each attempt — generalised from a generic job/processor pair onto
//! the fixed [`Job`]/[`JobHandler`] model and a [`HandlerRegistry`] keyed by
//! `kind`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::broker::Broker;
use crate::error::BrokerResult;
use crate::event::{Delivery, DeliveryTag};
use crate::job::{HandlerOutcome, Job, JobHandler, JobResult, ResultStatus, Session};
use crate::metrics::{self, ErrorType, JobStatus};
use crate::store::StoreClient;

/// Bounded grace period the worker waits for an in-flight job to finish
/// once shutdown is requested (§5 Cancellation).
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Lifecycle state of a single worker process (§4.D state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Idle = 0,
    Waiting = 1,
    Busy = 2,
    Error = 3,
    Shutdown = 4,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Waiting => "waiting",
            Self::Busy => "busy",
            Self::Error => "error",
            Self::Shutdown => "shutdown",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Waiting,
            2 => Self::Busy,
            3 => Self::Error,
            4 => Self::Shutdown,
            _ => Self::Idle,
        }
    }
}

/// Maps `job.kind` to the handler that processes it. Unknown kinds are a
/// permanent failure (§4.D Dispatch).
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, handler: impl JobHandler + 'static) -> Self {
        self.handlers.insert(handler.kind().to_string(), Arc::new(handler));
        self
    }

    fn get(&self, kind: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(kind).cloned()
    }
}

/// Point-in-time readout of a worker's counters, as surfaced by `/health`
/// and `/metrics`.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub state: WorkerState,
    pub jobs_processed: u64,
    pub jobs_failed: u64,
    pub uptime_seconds: u64,
}

/// Shared, lock-free counters read concurrently by the HTTP health surface
/// and written by the worker loop and the heartbeat task.
pub struct SharedStatus {
    state: AtomicU8,
    jobs_processed: AtomicU64,
    jobs_failed: AtomicU64,
    started_at: Instant,
}

impl SharedStatus {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(WorkerState::Idle as u8),
            jobs_processed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Relaxed))
    }

    fn record_success(&self) {
        self.jobs_processed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.jobs_processed.fetch_add(1, Ordering::Relaxed);
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            state: self.state(),
            jobs_processed: self.jobs_processed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            uptime_seconds: self.uptime_seconds(),
        }
    }
}

/// Runs the consume/dispatch/ack loop for one worker class, plus its
/// heartbeat task, until told to shut down.
pub struct WorkerRuntime {
    broker: Broker,
    store: Arc<dyn StoreClient>,
    registry: HandlerRegistry,
    worker_id: String,
    class: String,
    status: Arc<SharedStatus>,
    sessions: HashMap<String, Session>,
    task_counts: HashMap<String, u32>,
    max_tasks_per_child: u32,
    max_retries: u32,
    heartbeat_interval: Duration,
}

impl WorkerRuntime {
    pub fn new(broker: Broker, store: Arc<dyn StoreClient>, registry: HandlerRegistry) -> Self {
        let config = broker.config();
        Self {
            worker_id: config.consumer_id.clone(),
            class: config.class.clone(),
            max_tasks_per_child: config.max_tasks_per_child,
            max_retries: config.max_retries,
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
            status: Arc::new(SharedStatus::new()),
            sessions: HashMap::new(),
            task_counts: HashMap::new(),
            broker,
            store,
            registry,
        }
    }

    /// Shared handle read by the HTTP health surface (§4.D observability).
    pub fn status(&self) -> Arc<SharedStatus> {
        self.status.clone()
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    /// Runs until `shutdown` is set, draining the in-flight job and tearing
    /// down sessions before returning.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> BrokerResult<()> {
        info!(worker_id = %self.worker_id, class = %self.class, "starting worker runtime");
        self.broker.ensure_queue().await?;

        let own_pending = self.broker.consume_own_pending().await?;
        if !own_pending.is_empty() {
            info!(count = own_pending.len(), "resuming own unacked deliveries from a prior run");
            for delivery in own_pending {
                self.dispatch(delivery).await;
            }
        }

        let heartbeat = tokio::spawn(run_heartbeat(
            self.store.clone(),
            self.status.clone(),
            self.worker_id.clone(),
            self.class.clone(),
            self.heartbeat_interval,
            shutdown.clone(),
        ));

        let reclaim_interval = self.heartbeat_interval * 2;
        let mut last_reclaim = Instant::now();

        let drain_key = format!("worker:drain:{}", self.worker_id);

        loop {
            if *shutdown.borrow() {
                info!("shutdown requested, stopping worker runtime");
                break;
            }

            match self.store.get(&drain_key).await {
                Ok(Some(_)) => {
                    info!("drain requested via orchestrator API, stopping worker runtime");
                    break;
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "failed to check drain marker"),
            }

            self.status.set_state(WorkerState::Waiting);
            match self.broker.consume_batch().await {
                Ok(deliveries) if !deliveries.is_empty() => {
                    self.status.set_state(WorkerState::Busy);
                    metrics::record_batch_size(&self.broker.config().stream_name, deliveries.len());
                    for delivery in deliveries {
                        self.dispatch(delivery).await;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    self.status.set_state(WorkerState::Error);
                    warn!(error = %e, "error consuming batch, backing off");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
            self.status.set_state(WorkerState::Idle);

            if last_reclaim.elapsed() >= reclaim_interval {
                match self.broker.reclaim().await {
                    Ok(reclaimed) if !reclaimed.is_empty() => {
                        info!(count = reclaimed.len(), "reclaimed abandoned deliveries");
                        for delivery in reclaimed {
                            self.dispatch(delivery).await;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "reclaim failed"),
                }
                last_reclaim = Instant::now();
            }
        }

        self.status.set_state(WorkerState::Shutdown);
        for session in self.sessions.values_mut() {
            session.teardown();
        }
        if tokio::time::timeout(SHUTDOWN_GRACE, heartbeat).await.is_err() {
            warn!("heartbeat task did not stop within the shutdown grace period");
        }

        info!(worker_id = %self.worker_id, "worker runtime stopped");
        Ok(())
    }

    /// Dispatches one delivery to its handler and resolves the terminal
    /// outcome (ack, leave-pending-for-redelivery, or dead-letter).
    async fn dispatch(&mut self, delivery: Delivery) {
        let Delivery {
            tag,
            job,
            delivery_count,
            ..
        } = delivery;

        let Some(handler) = self.registry.get(&job.kind) else {
            warn!(kind = %job.kind, job_id = %job.id, "no handler registered for job kind");
            self.finish_dead_letter(&job, &tag, ResultStatus::PermanentError, "unknown job kind", delivery_count)
                .await;
            return;
        };

        let session = self.sessions.entry(job.kind.clone()).or_default();
        let start = Instant::now();
        let outcome = handler.process(&job, session).await;
        metrics::record_job_duration(&self.broker.config().stream_name, "process", start.elapsed());
        *self.task_counts.entry(job.kind.clone()).or_insert(0) += 1;

        match outcome {
            HandlerOutcome::Ok(payload) => self.finish_ok(&job, &tag, payload, delivery_count).await,
            HandlerOutcome::Transient(reason) => {
                let max_retries = handler.max_retries().min(self.max_retries);
                if delivery_count >= max_retries {
                    warn!(job_id = %job.id, delivery_count, max_retries, "exceeded max retries, dead-lettering");
                    self.finish_dead_letter(&job, &tag, ResultStatus::TransientError, &reason, delivery_count)
                        .await;
                } else {
                    metrics::record_error(&self.broker.config().stream_name, ErrorType::Transient);
                    metrics::record_retry(&self.broker.config().stream_name, delivery_count + 1);
                    metrics::record_job_processed(&self.broker.config().stream_name, JobStatus::Failed);
                    debug!(job_id = %job.id, delivery_count, reason, "transient failure, leaving pending for redelivery");
                    self.status.record_failure();
                }
            }
            HandlerOutcome::Permanent(reason) => {
                metrics::record_error(&self.broker.config().stream_name, ErrorType::Permanent);
                self.finish_dead_letter(&job, &tag, ResultStatus::PermanentError, &reason, delivery_count)
                    .await;
            }
        }

        self.recycle_session_if_exhausted(&job.kind);
    }

    async fn finish_ok(&mut self, job: &Job, tag: &DeliveryTag, payload: Value, attempt: u32) {
        metrics::record_job_processed(&self.broker.config().stream_name, JobStatus::Success);
        if let Err(e) = self.broker.ack(tag).await {
            error!(error = %e, job_id = %job.id, "failed to ack successful delivery");
        }
        self.publish_result(job, JobResult::ok(job, &self.worker_id, payload, attempt)).await;
        self.status.record_success();
    }

    async fn finish_dead_letter(
        &mut self,
        job: &Job,
        tag: &DeliveryTag,
        status: ResultStatus,
        reason: &str,
        attempt: u32,
    ) {
        metrics::record_job_processed(&self.broker.config().stream_name, JobStatus::Dlq);
        if let Err(e) = self.broker.dead_letter(job, tag, reason).await {
            error!(error = %e, job_id = %job.id, "failed to dead-letter job");
        }
        self.publish_result(job, JobResult::failure(job, &self.worker_id, status, reason, attempt))
            .await;
        self.status.record_failure();
    }

    async fn publish_result(&self, job: &Job, result: JobResult) {
        let Some(stream) = &job.reply_stream else {
            return;
        };
        if let Err(e) = self.broker.reply(stream, &result).await {
            error!(error = %e, job_id = %job.id, "failed to publish job result");
        }
    }

    /// Tears down and recycles a kind's session once it has processed
    /// `max_tasks_per_child` jobs, bounding per-process resource leaks.
    fn recycle_session_if_exhausted(&mut self, kind: &str) {
        if self.max_tasks_per_child == 0 {
            return;
        }
        let Some(count) = self.task_counts.get(kind).copied() else {
            return;
        };
        if count < self.max_tasks_per_child {
            return;
        }
        if let Some(session) = self.sessions.get_mut(kind) {
            session.teardown();
        }
        self.task_counts.insert(kind.to_string(), 0);
        debug!(kind, max_tasks = self.max_tasks_per_child, "session recycled");
    }
}

/// Periodically writes a heartbeat hash (`worker:heartbeat:<id>`, TTL
/// `3×interval`) and appends a snapshot to `worker:status`, until
/// `shutdown` fires, then flushes one final heartbeat marked `shutdown`.
async fn run_heartbeat(
    store: Arc<dyn StoreClient>,
    status: Arc<SharedStatus>,
    worker_id: String,
    class: String,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let key = format!("worker:heartbeat:{worker_id}");
    let ttl_secs = (interval.as_secs() * 3).max(1) as i64;

    loop {
        write_heartbeat(&store, &key, ttl_secs, &status, &worker_id, &class).await;

        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }

    status.set_state(WorkerState::Shutdown);
    write_heartbeat(&store, &key, ttl_secs, &status, &worker_id, &class).await;
}

async fn write_heartbeat(
    store: &Arc<dyn StoreClient>,
    key: &str,
    ttl_secs: i64,
    status: &SharedStatus,
    worker_id: &str,
    class: &str,
) {
    let snapshot = status.snapshot();
    let jobs_processed = snapshot.jobs_processed.to_string();
    let jobs_failed = snapshot.jobs_failed.to_string();
    let uptime_seconds = snapshot.uptime_seconds.to_string();
    let updated_at = Utc::now().to_rfc3339();

    let fields = [
        ("worker_id", worker_id),
        ("class", class),
        ("state", snapshot.state.as_str()),
        ("jobs_processed", jobs_processed.as_str()),
        ("jobs_failed", jobs_failed.as_str()),
        ("uptime_seconds", uptime_seconds.as_str()),
        ("updated_at", updated_at.as_str()),
    ];

    if let Err(e) = store.hset(key, &fields).await {
        warn!(error = %e, "failed to write heartbeat hash");
    } else if let Err(e) = store.expire(key, ttl_secs).await {
        warn!(error = %e, "failed to set heartbeat TTL");
    }

    // Same flat fields as the heartbeat hash above: the scaling service's
    // busy-heartbeat scan and the orchestrator's worker listing both read
    // this stream by field name rather than parsing an embedded blob.
    if let Err(e) = store.append("worker:status", &fields, Some(10_000)).await {
        debug!(error = %e, "failed to append worker status entry");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use crate::store::tests::FakeStoreClient;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    struct EchoHandler;

    #[async_trait]
    impl JobHandler for EchoHandler {
        fn kind(&self) -> &str {
            "demo.echo"
        }

        async fn process(&self, job: &Job, session: &mut Session) -> HandlerOutcome {
            let calls = session.get_or_insert_with(|| 0u32);
            *calls += 1;
            HandlerOutcome::Ok(job.payload.clone())
        }
    }

    struct FlakyHandler {
        attempts: AtomicU32,
    }

    #[async_trait]
    impl JobHandler for FlakyHandler {
        fn kind(&self) -> &str {
            "demo.flaky"
        }

        async fn process(&self, _job: &Job, _session: &mut Session) -> HandlerOutcome {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            HandlerOutcome::Transient("not yet".to_string())
        }

        fn max_retries(&self) -> u32 {
            2
        }
    }

    struct RejectHandler;

    #[async_trait]
    impl JobHandler for RejectHandler {
        fn kind(&self) -> &str {
            "demo.reject"
        }

        async fn process(&self, _job: &Job, _session: &mut Session) -> HandlerOutcome {
            HandlerOutcome::Permanent("invalid payload".to_string())
        }
    }

    fn runtime_with(registry: HandlerRegistry) -> WorkerRuntime {
        let store: Arc<dyn StoreClient> = Arc::new(FakeStoreClient::default());
        let config = BrokerConfig::for_class("demo").with_consumer_id("worker-1");
        let broker = Broker::new(store.clone(), config);
        WorkerRuntime::new(broker, store, registry)
    }

    #[tokio::test]
    async fn run_stops_promptly_when_drain_marker_is_set() {
        let runtime = runtime_with(HandlerRegistry::new());
        runtime
            .store
            .set(&format!("worker:drain:{}", runtime.worker_id()), "requested")
            .await
            .unwrap();

        let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let result = tokio::time::timeout(Duration::from_secs(5), runtime.run(shutdown_rx)).await;

        assert!(result.is_ok(), "runtime should stop on its own once drained");
        assert!(result.unwrap().is_ok());
    }

    #[tokio::test]
    async fn successful_job_is_acked_and_session_reused() {
        let mut runtime = runtime_with(HandlerRegistry::new().register(EchoHandler));
        let job = Job::new("demo.echo", json!({"n": 1}), "corr-1");
        runtime.broker.publish(&job).await.unwrap();
        let delivery = runtime.broker.consume().await.unwrap().unwrap();

        runtime.dispatch(delivery).await;

        assert_eq!(runtime.status.snapshot().jobs_processed, 1);
        assert_eq!(runtime.status.snapshot().jobs_failed, 0);
        assert!(runtime.sessions.contains_key("demo.echo"));
    }

    #[tokio::test]
    async fn permanent_failure_dead_letters_without_retry() {
        let mut runtime = runtime_with(HandlerRegistry::new().register(RejectHandler));
        let job = Job::new("demo.reject", json!({}), "corr-1");
        runtime.broker.publish(&job).await.unwrap();
        let delivery = runtime.broker.consume().await.unwrap().unwrap();

        runtime.dispatch(delivery).await;

        let stats = runtime.broker.config().clone();
        assert_eq!(runtime.store.len(&stats.dlq_stream).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_kind_is_dead_lettered() {
        let mut runtime = runtime_with(HandlerRegistry::new());
        let job = Job::new("demo.missing", json!({}), "corr-1");
        runtime.broker.publish(&job).await.unwrap();
        let delivery = runtime.broker.consume().await.unwrap().unwrap();

        runtime.dispatch(delivery).await;

        let dlq_stream = runtime.broker.config().dlq_stream.clone();
        assert_eq!(runtime.store.len(&dlq_stream).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn transient_failure_below_max_retries_stays_pending() {
        let handler = FlakyHandler {
            attempts: AtomicU32::new(0),
        };
        let mut runtime = runtime_with(HandlerRegistry::new().register(handler));
        let job = Job::new("demo.flaky", json!({}), "corr-1");
        runtime.broker.publish(&job).await.unwrap();
        let delivery = runtime.broker.consume().await.unwrap().unwrap();
        assert_eq!(delivery.delivery_count, 1);

        runtime.dispatch(delivery).await;

        let dlq_stream = runtime.broker.config().dlq_stream.clone();
        assert_eq!(runtime.store.len(&dlq_stream).await.unwrap(), 0);
        assert_eq!(runtime.status.snapshot().jobs_failed, 1);
    }

    #[tokio::test]
    async fn transient_failure_at_max_retries_is_dead_lettered() {
        let handler = FlakyHandler {
            attempts: AtomicU32::new(0),
        };
        let mut runtime = runtime_with(HandlerRegistry::new().register(handler));
        let job = Job::new("demo.flaky", json!({}), "corr-1");
        runtime.broker.publish(&job).await.unwrap();
        let mut delivery = runtime.broker.consume().await.unwrap().unwrap();
        delivery.delivery_count = 2;

        runtime.dispatch(delivery).await;

        let dlq_stream = runtime.broker.config().dlq_stream.clone();
        assert_eq!(runtime.store.len(&dlq_stream).await.unwrap(), 1);
    }
}
