//! Autoscaler loop (§4.G): single-threaded cooperative loop ticking every
//! enabled worker class on a fixed interval, health-gating decisions on the
//! store so a disconnected metrics source never drives a scaling call.

use std::sync::Arc;
use std::time::Duration;

use broker::store::StoreClient;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::WorkerClassConfig;
use crate::service::ScalingService;

pub struct AutoscalerLoop {
    service: Arc<ScalingService>,
    store: Arc<dyn StoreClient>,
    classes: Vec<WorkerClassConfig>,
    check_interval: Duration,
}

impl AutoscalerLoop {
    pub fn new(service: Arc<ScalingService>, store: Arc<dyn StoreClient>, classes: Vec<WorkerClassConfig>) -> Self {
        Self { service, store, classes, check_interval: Duration::from_secs(30) }
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Runs the loop until `shutdown` fires. Each tick iterates every
    /// enabled class in turn; a single class's failure is logged and does
    /// not stop the tick (§4.G). The loop tolerates `current == 0` for every
    /// class — cold start requires no existing worker heartbeats.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(classes = self.classes.len(), interval_secs = self.check_interval.as_secs(), "starting autoscaler loop");
        let mut interval = tokio::time::interval(self.check_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("autoscaler loop draining current tick before shutdown");
                        break;
                    }
                    continue;
                }
            }

            if self.store.ping().await.is_err() {
                warn!("store unhealthy, postponing this tick's scaling decisions");
                continue;
            }

            for class in &self.classes {
                if !class.enabled {
                    continue;
                }
                let event = self.service.tick(class).await;
                if event.error.is_some() {
                    warn!(class = %class.class, error = ?event.error, "scaling tick failed for this class, continuing with the rest");
                }
            }
        }

        info!("autoscaler loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendHealth, ScalingBackend, ScalingResult};
    use async_trait::async_trait;

    struct NoopBackend;
    #[async_trait]
    impl ScalingBackend for NoopBackend {
        async fn list(&self, _class: &str) -> ScalingResult<u32> {
            Ok(0)
        }
        async fn scale(&self, _class: &str, target: u32) -> ScalingResult<u32> {
            Ok(target)
        }
        async fn health(&self) -> BackendHealth {
            BackendHealth::Ok
        }
    }

    /// Minimal always-healthy store double; the shutdown test never reaches
    /// a class tick, so only `ping` needs to succeed.
    struct AlwaysUpStore;
    #[async_trait]
    impl StoreClient for AlwaysUpStore {
        async fn set(&self, _k: &str, _v: &str) -> broker::error::BrokerResult<()> { Ok(()) }
        async fn get(&self, _k: &str) -> broker::error::BrokerResult<Option<String>> { Ok(None) }
        async fn hset(&self, _k: &str, _f: &[(&str, &str)]) -> broker::error::BrokerResult<()> { Ok(()) }
        async fn hgetall(&self, _k: &str) -> broker::error::BrokerResult<std::collections::HashMap<String, String>> { Ok(Default::default()) }
        async fn expire(&self, _k: &str, _t: i64) -> broker::error::BrokerResult<()> { Ok(()) }
        async fn ensure_group(&self, _s: &str, _g: &str) -> broker::error::BrokerResult<()> { Ok(()) }
        async fn append(&self, _s: &str, _f: &[(&str, &str)], _m: Option<i64>) -> broker::error::BrokerResult<String> { Ok("1-0".to_string()) }
        async fn read_group(&self, _s: &str, _g: &str, _c: &str, _n: usize, _b: Option<u64>) -> broker::error::BrokerResult<Vec<broker::store::RawEntry>> { Ok(vec![]) }
        async fn read_pending_own(&self, _s: &str, _g: &str, _c: &str, _n: usize) -> broker::error::BrokerResult<Vec<broker::store::RawEntry>> { Ok(vec![]) }
        async fn ack(&self, _s: &str, _g: &str, _e: &str) -> broker::error::BrokerResult<()> { Ok(()) }
        async fn len(&self, _s: &str) -> broker::error::BrokerResult<u64> { Ok(0) }
        async fn pending_summary(&self, _s: &str, _g: &str) -> broker::error::BrokerResult<broker::store::PendingSummary> { Ok(Default::default()) }
        async fn pending_range(&self, _s: &str, _g: &str, _m: u64, _c: usize) -> broker::error::BrokerResult<Vec<broker::store::PendingEntry>> { Ok(vec![]) }
        async fn autoclaim(&self, _s: &str, _g: &str, _c: &str, _m: u64, _st: &str, _cnt: usize) -> broker::error::BrokerResult<(String, Vec<broker::store::RawEntry>)> { Ok(("0-0".to_string(), vec![])) }
        async fn trim(&self, _s: &str, _m: i64) -> broker::error::BrokerResult<()> { Ok(()) }
        async fn group_info(&self, _s: &str, _g: &str) -> broker::error::BrokerResult<broker::store::GroupInfo> { Ok(Default::default()) }
        async fn range(&self, _s: &str, _a: &str, _b: &str, _c: usize) -> broker::error::BrokerResult<Vec<broker::store::RawEntry>> { Ok(vec![]) }
        async fn revrange(&self, _s: &str, _a: &str, _b: &str, _c: usize) -> broker::error::BrokerResult<Vec<broker::store::RawEntry>> { Ok(vec![]) }
        async fn delete_entries(&self, _s: &str, _e: &[String]) -> broker::error::BrokerResult<u64> { Ok(0) }
        async fn publish(&self, _c: &str, _m: &str) -> broker::error::BrokerResult<()> { Ok(()) }
        async fn ping(&self) -> broker::error::BrokerResult<()> { Ok(()) }
    }

    #[tokio::test]
    async fn stops_promptly_on_shutdown_signal() {
        let store: Arc<dyn StoreClient> = Arc::new(AlwaysUpStore);
        let service = Arc::new(ScalingService::new(store.clone(), Arc::new(NoopBackend)));
        let loop_ = AutoscalerLoop::new(service, store, vec![]).with_check_interval(Duration::from_millis(10));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(loop_.run(rx));

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
