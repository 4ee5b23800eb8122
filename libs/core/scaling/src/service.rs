//! Scaling service (§4.F): the per-worker-class policy engine. One
//! `tick(class)` call reads `true_depth` (C) and `current` (E), decides a
//! target, and — if it differs from `current` — calls `E.scale`, emits a
//! [`ScalingEvent`], and records the last-change timestamp used for the
//! next tick's cooldown check.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use broker::queue_metrics;
use broker::store::StoreClient;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::backend::{ScalingBackend, ScalingError};
use crate::config::WorkerClassConfig;
use crate::event::{ScalingEvent, ScalingReason};
use crate::metrics;

/// How far back into `worker:status` to look for a `busy` heartbeat from
/// this class before allowing a scale-down.
const BUSY_LOOKBACK_ENTRIES: usize = 200;

pub struct ScalingService {
    store: Arc<dyn StoreClient>,
    backend: Arc<dyn ScalingBackend>,
    last_change: Mutex<HashMap<String, Instant>>,
}

impl ScalingService {
    pub fn new(store: Arc<dyn StoreClient>, backend: Arc<dyn ScalingBackend>) -> Self {
        Self { store, backend, last_change: Mutex::new(HashMap::new()) }
    }

    /// Runs one tick of the §4.F algorithm for `config.class`, returning the
    /// [`ScalingEvent`] it recorded (also appended to the store).
    pub async fn tick(&self, config: &WorkerClassConfig) -> ScalingEvent {
        let start = Instant::now();
        let event = self.decide_and_apply(config).await;
        metrics::record_decision_duration(&config.class, start.elapsed());
        metrics::record_event(&config.class, event.reason.as_str());
        if let Some(replicas) = event.observed_replicas {
            metrics::set_replicas(&config.class, replicas as f64);
        }
        if let Err(e) = event.append(self.store.as_ref()).await {
            warn!(class = %config.class, error = %e, "failed to append scaling event");
        }
        event
    }

    async fn decide_and_apply(&self, config: &WorkerClassConfig) -> ScalingEvent {
        let true_depth = match queue_metrics::compute(self.store.as_ref(), &config.queue_stream, &config.consumer_group).await {
            Ok(m) => m.true_depth,
            Err(e) => return ScalingEvent::error(&config.class, 0, 0, format!("queue metrics unavailable: {e}")),
        };

        let current = match self.backend.list(&config.class).await {
            Ok(n) => n,
            Err(e) => return ScalingEvent::error(&config.class, true_depth, 0, format!("backend list failed: {e}")),
        };

        let cooldown_elapsed = self.cooldown_elapsed(&config.class, config.cooldown).await;

        let target = if true_depth >= config.scale_up_threshold && current < config.max_replicas && cooldown_elapsed {
            let step = config.step_up(true_depth, current);
            (current + step).min(config.max_replicas)
        } else if true_depth <= config.scale_down_threshold
            && current > config.min_replicas
            && cooldown_elapsed
            && !self.has_busy_heartbeat(&config.class).await
        {
            current.saturating_sub(config.step_down).max(config.min_replicas)
        } else {
            current
        };

        if target == current {
            return ScalingEvent::hold(&config.class, true_depth, current);
        }

        match self.backend.scale(&config.class, target).await {
            Ok(observed) => {
                self.last_change.lock().await.insert(config.class.clone(), Instant::now());
                let reason = if target > current { ScalingReason::ScaleUp } else { ScalingReason::ScaleDown };
                info!(class = %config.class, %current, %target, observed, "scaling decision applied");
                ScalingEvent {
                    class: config.class.clone(),
                    reason,
                    true_depth,
                    previous_replicas: current,
                    target_replicas: target,
                    observed_replicas: Some(observed),
                    error: None,
                    at: chrono::Utc::now(),
                }
            }
            Err(ScalingError::OutOfBounds { target, max_replicas }) => {
                ScalingEvent::error(&config.class, true_depth, current, format!("target {target} exceeds max_replicas {max_replicas}"))
            }
            Err(e) => {
                warn!(class = %config.class, error = %e, "scaling backend call failed, next tick will retry");
                ScalingEvent::error(&config.class, true_depth, current, e.to_string())
            }
        }
    }

    async fn cooldown_elapsed(&self, class: &str, cooldown: Duration) -> bool {
        match self.last_change.lock().await.get(class) {
            Some(last) => last.elapsed() >= cooldown,
            None => true,
        }
    }

    /// Scans the tail of `worker:status` for a recent entry from `class`
    /// reporting `state=busy`. Scale-down is refused while any worker in
    /// the class is actively processing a job, per §4.F.
    async fn has_busy_heartbeat(&self, class: &str) -> bool {
        let entries = match self.store.revrange("worker:status", "-", "+", BUSY_LOOKBACK_ENTRIES).await {
            Ok(entries) => entries,
            Err(_) => return false,
        };

        entries.iter().any(|(_, fields)| {
            fields.get("class").map(|c| c == class).unwrap_or(false)
                && fields.get("state").map(|s| s == "busy").unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use broker::store::RawEntry;
    use crate::backend::{BackendHealth, ScalingResult};
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    struct FakeStore {
        stream_len: u64,
        status_entries: Vec<RawEntry>,
    }

    #[async_trait]
    impl StoreClient for FakeStore {
        async fn set(&self, _k: &str, _v: &str) -> broker::error::BrokerResult<()> { Ok(()) }
        async fn get(&self, _k: &str) -> broker::error::BrokerResult<Option<String>> { Ok(None) }
        async fn hset(&self, _k: &str, _f: &[(&str, &str)]) -> broker::error::BrokerResult<()> { Ok(()) }
        async fn hgetall(&self, _k: &str) -> broker::error::BrokerResult<StdHashMap<String, String>> { Ok(StdHashMap::new()) }
        async fn expire(&self, _k: &str, _t: i64) -> broker::error::BrokerResult<()> { Ok(()) }
        async fn ensure_group(&self, _s: &str, _g: &str) -> broker::error::BrokerResult<()> { Ok(()) }
        async fn append(&self, _s: &str, _f: &[(&str, &str)], _m: Option<i64>) -> broker::error::BrokerResult<String> { Ok("1-0".to_string()) }
        async fn read_group(&self, _s: &str, _g: &str, _c: &str, _n: usize, _b: Option<u64>) -> broker::error::BrokerResult<Vec<RawEntry>> { Ok(vec![]) }
        async fn read_pending_own(&self, _s: &str, _g: &str, _c: &str, _n: usize) -> broker::error::BrokerResult<Vec<RawEntry>> { Ok(vec![]) }
        async fn ack(&self, _s: &str, _g: &str, _e: &str) -> broker::error::BrokerResult<()> { Ok(()) }
        async fn len(&self, _s: &str) -> broker::error::BrokerResult<u64> { Ok(self.stream_len) }
        async fn pending_summary(&self, _s: &str, _g: &str) -> broker::error::BrokerResult<broker::store::PendingSummary> { Ok(Default::default()) }
        async fn pending_range(&self, _s: &str, _g: &str, _m: u64, _c: usize) -> broker::error::BrokerResult<Vec<broker::store::PendingEntry>> { Ok(vec![]) }
        async fn autoclaim(&self, _s: &str, _g: &str, _c: &str, _m: u64, _st: &str, _cnt: usize) -> broker::error::BrokerResult<(String, Vec<RawEntry>)> { Ok(("0-0".to_string(), vec![])) }
        async fn trim(&self, _s: &str, _m: i64) -> broker::error::BrokerResult<()> { Ok(()) }
        async fn group_info(&self, _s: &str, _g: &str) -> broker::error::BrokerResult<broker::store::GroupInfo> { Ok(Default::default()) }
        async fn range(&self, _s: &str, _a: &str, _b: &str, _c: usize) -> broker::error::BrokerResult<Vec<RawEntry>> { Ok(vec![]) }
        async fn revrange(&self, _s: &str, _a: &str, _b: &str, _c: usize) -> broker::error::BrokerResult<Vec<RawEntry>> { Ok(self.status_entries.clone()) }
        async fn delete_entries(&self, _s: &str, _e: &[String]) -> broker::error::BrokerResult<u64> { Ok(0) }
        async fn publish(&self, _c: &str, _m: &str) -> broker::error::BrokerResult<()> { Ok(()) }
        async fn ping(&self) -> broker::error::BrokerResult<()> { Ok(()) }
    }

    struct FakeBackend {
        current: AtomicU32,
        scale_calls: StdMutex<Vec<u32>>,
    }

    impl FakeBackend {
        fn new(current: u32) -> Self {
            Self { current: AtomicU32::new(current), scale_calls: StdMutex::new(vec![]) }
        }
    }

    #[async_trait]
    impl ScalingBackend for FakeBackend {
        async fn list(&self, _class: &str) -> ScalingResult<u32> {
            Ok(self.current.load(Ordering::SeqCst))
        }
        async fn scale(&self, _class: &str, target: u32) -> ScalingResult<u32> {
            self.current.store(target, Ordering::SeqCst);
            self.scale_calls.lock().unwrap().push(target);
            Ok(target)
        }
        async fn health(&self) -> BackendHealth {
            BackendHealth::Ok
        }
    }

    fn status_entry(class: &str, state: &str) -> RawEntry {
        let mut fields = StdHashMap::new();
        fields.insert("class".to_string(), class.to_string());
        fields.insert("state".to_string(), state.to_string());
        ("1-0".to_string(), fields)
    }

    #[tokio::test]
    async fn scales_up_when_true_depth_exceeds_threshold() {
        let store = Arc::new(FakeStore { stream_len: 100, status_entries: vec![] });
        let backend = Arc::new(FakeBackend::new(1));
        let service = ScalingService::new(store, backend.clone());
        let config = WorkerClassConfig::new("demo").with_replica_bounds(0, 10).with_thresholds(50, 5);

        let event = service.tick(&config).await;

        assert_eq!(event.reason, ScalingReason::ScaleUp);
        assert_eq!(backend.current.load(Ordering::SeqCst), event.target_replicas);
        assert!(event.target_replicas > 1);
    }

    #[tokio::test]
    async fn holds_when_depth_is_mid_range() {
        let store = Arc::new(FakeStore { stream_len: 10, status_entries: vec![] });
        let backend = Arc::new(FakeBackend::new(3));
        let service = ScalingService::new(store, backend);
        let config = WorkerClassConfig::new("demo").with_replica_bounds(1, 10).with_thresholds(50, 5);

        let event = service.tick(&config).await;
        assert_eq!(event.reason, ScalingReason::Hold);
        assert_eq!(event.target_replicas, 3);
    }

    #[tokio::test]
    async fn refuses_scale_down_while_busy_heartbeat_present() {
        let store = Arc::new(FakeStore {
            stream_len: 0,
            status_entries: vec![status_entry("demo", "busy")],
        });
        let backend = Arc::new(FakeBackend::new(3));
        let service = ScalingService::new(store, backend.clone());
        let config = WorkerClassConfig::new("demo").with_replica_bounds(0, 10).with_thresholds(50, 5);

        let event = service.tick(&config).await;
        assert_eq!(event.reason, ScalingReason::Hold);
        assert_eq!(backend.current.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn scales_down_from_zero_busy_to_min_replicas() {
        let store = Arc::new(FakeStore { stream_len: 0, status_entries: vec![] });
        let backend = Arc::new(FakeBackend::new(3));
        let service = ScalingService::new(store, backend.clone());
        let config = WorkerClassConfig::new("demo").with_replica_bounds(1, 10).with_thresholds(50, 5).with_step_down(1);

        let event = service.tick(&config).await;
        assert_eq!(event.reason, ScalingReason::ScaleDown);
        assert_eq!(event.target_replicas, 2);
        assert_eq!(backend.current.load(Ordering::SeqCst), 2);
    }
}
