//! The queue broker (§4.B): produce/consume jobs on named streams via
//! consumer groups, explicit acknowledgement, reclaim of abandoned work,
//! and dead-lettering on repeated failure.
//!
//! Grounded on this crate's former stream consumer/producer pair (raw
//! `XADD`/`XREADGROUP`/`XACK`/`XAUTOCLAIM` usage), generalised from a
//! generic `StreamJob` trait onto the fixed [`Job`] envelope and the
//! [`StoreClient`] abstraction so the broker is agnostic to which backend
//! (direct Redis or the resilient fallback composite) it talks to.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::error::{BrokerError, BrokerResult};
use crate::event::{Delivery, DeliveryTag};
use crate::job::{decode_job, encode_job, Job, JobResult};
use crate::store::StoreClient;

/// Queue broker bound to one worker class's stream/group, per
/// [`BrokerConfig`]. Cheap to clone — wraps an `Arc<dyn StoreClient>`.
pub struct Broker {
    store: Arc<dyn StoreClient>,
    config: BrokerConfig,
}

impl Broker {
    pub fn new(store: Arc<dyn StoreClient>, config: BrokerConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Idempotently creates the stream and its consumer group (§4.B
    /// Startup). A race between two workers is tolerated: the store
    /// reports `BUSYGROUP` to the loser, which is treated as success.
    pub async fn ensure_queue(&self) -> BrokerResult<()> {
        self.store
            .ensure_group(&self.config.stream_name, &self.config.consumer_group)
            .await
    }

    /// Appends a job to the stream resolved from `job.kind`'s queue
    /// prefix, trimming approximately to `max_length`. Returns once the
    /// store confirms the append. The broker does not deduplicate;
    /// idempotence on retry is the caller's responsibility.
    pub async fn publish(&self, job: &Job) -> BrokerResult<String> {
        let stream = format!("{}:jobs", job.queue_name());
        let data = encode_job(job)?;
        let id = self
            .store
            .append(&stream, &[("job", &data)], Some(self.config.max_length))
            .await?;
        debug!(job_id = %job.id, kind = %job.kind, entry_id = %id, "published job");
        Ok(id)
    }

    /// Blocking read of up to one new entry via the consumer group.
    /// Returns `None` on timeout. Does **not** acknowledge the delivery.
    pub async fn consume(&self) -> BrokerResult<Option<Delivery>> {
        let entries = self
            .store
            .read_group(
                &self.config.stream_name,
                &self.config.consumer_group,
                &self.config.consumer_id,
                1,
                self.config.blocking_timeout_ms,
            )
            .await?;
        Ok(self.decode_first(entries).await)
    }

    /// Reads up to `batch_size` new entries in one round-trip, for the
    /// concurrent-processing worker mode.
    pub async fn consume_batch(&self) -> BrokerResult<Vec<Delivery>> {
        let entries = self
            .store
            .read_group(
                &self.config.stream_name,
                &self.config.consumer_group,
                &self.config.consumer_id,
                self.config.batch_size,
                self.config.blocking_timeout_ms,
            )
            .await?;
        Ok(self.decode_all(entries).await)
    }

    /// Reads this consumer's own already-delivered-but-unacked entries —
    /// the entries it held when it last exited uncleanly.
    pub async fn consume_own_pending(&self) -> BrokerResult<Vec<Delivery>> {
        let entries = self
            .store
            .read_pending_own(
                &self.config.stream_name,
                &self.config.consumer_group,
                &self.config.consumer_id,
                self.config.batch_size,
            )
            .await?;
        Ok(self.decode_all(entries).await)
    }

    /// Claims pending entries idle for longer than `min_idle_ms` from
    /// their original consumers onto this one — used to rescue work
    /// abandoned by crashed peers (§4.B reclaim, scenario S5).
    pub async fn reclaim(&self) -> BrokerResult<Vec<Delivery>> {
        let mut claimed = Vec::new();
        let mut cursor = "0-0".to_string();

        loop {
            let (next, entries) = self
                .store
                .autoclaim(
                    &self.config.stream_name,
                    &self.config.consumer_group,
                    &self.config.consumer_id,
                    self.config.min_idle_ms,
                    &cursor,
                    self.config.batch_size,
                )
                .await?;

            if entries.is_empty() {
                break;
            }

            // `autoclaim` hands back the stream fields only; the PEL's real
            // per-entry delivery count lives in `XPENDING`, so look it up
            // for the entries we just claimed rather than guessing.
            let counts = self.pending_delivery_counts(&entries).await;

            claimed.extend(self.decode_all(entries).await.into_iter().map(|mut delivery| {
                delivery.delivery_count = counts.get(&delivery.tag.entry_id).copied().unwrap_or(2) as u32;
                delivery
            }));

            if next == "0-0" || next == cursor {
                break;
            }
            cursor = next;
        }

        if !claimed.is_empty() {
            info!(
                count = claimed.len(),
                consumer = %self.config.consumer_id,
                "reclaimed abandoned deliveries"
            );
        }
        Ok(claimed)
    }

    /// Looks up the real per-entry delivery count from the PEL (`XPENDING
    /// ... IDLE <min_idle_ms>`) for entries `autoclaim` just handed back.
    /// Entries that drop out of the PEL between the two calls (acked by a
    /// racing consumer) are simply absent from the result.
    async fn pending_delivery_counts(&self, entries: &[crate::store::RawEntry]) -> HashMap<String, u64> {
        let count = self.config.batch_size.max(entries.len());
        match self
            .store
            .pending_range(&self.config.stream_name, &self.config.consumer_group, self.config.min_idle_ms, count)
            .await
        {
            Ok(pending) => pending.into_iter().map(|p| (p.entry_id, p.delivery_count)).collect(),
            Err(e) => {
                warn!(error = %e, "failed to look up pending delivery counts, assuming a single reclaim");
                HashMap::new()
            }
        }
    }

    /// Acknowledges a delivery after it reaches a terminal outcome.
    pub async fn ack(&self, tag: &DeliveryTag) -> BrokerResult<()> {
        self.store.ack(&tag.stream, &self.config.consumer_group, &tag.entry_id).await
    }

    /// Appends `job` to `<queue>:dead` and acknowledges the original
    /// delivery. Invoked once `retry_count ≥ max_retries`.
    pub async fn dead_letter(&self, job: &Job, tag: &DeliveryTag, reason: &str) -> BrokerResult<()> {
        let data = encode_job(job)?;
        self.store
            .append(
                &self.config.dlq_stream,
                &[("job", &data), ("error", reason), ("failed_at", &Utc::now().to_rfc3339())],
                None,
            )
            .await?;
        self.ack(tag).await?;
        warn!(job_id = %job.id, reason, "job moved to dead-letter queue");
        Ok(())
    }

    /// Appends a result to `reply_stream` if the job requested one;
    /// consumers of results read that stream with a disposable group.
    pub async fn reply(&self, reply_stream: &str, result: &JobResult) -> BrokerResult<()> {
        let data = serde_json::to_string(result).map_err(BrokerError::Serialization)?;
        self.store.append(reply_stream, &[("result", &data)], None).await?;
        Ok(())
    }

    /// Dead-letters an entry that never decoded into a `Job` at all (bad
    /// JSON, or missing the `job` field), per the `JobDecodeError` contract:
    /// acknowledge it and record the failure, with no retry, since there is
    /// no handler that could ever process it.
    async fn dead_letter_raw(&self, tag: &DeliveryTag, reason: &str) -> BrokerResult<()> {
        self.store
            .append(
                &self.config.dlq_stream,
                &[("error", reason), ("failed_at", &Utc::now().to_rfc3339()), ("source_entry_id", &tag.entry_id)],
                None,
            )
            .await?;
        self.ack(tag).await?;
        warn!(entry_id = %tag.entry_id, reason, "undecodable entry moved to dead-letter queue");
        Ok(())
    }

    async fn decode_first(&self, entries: Vec<crate::store::RawEntry>) -> Option<Delivery> {
        for (id, fields) in entries {
            if let Some(delivery) = self.decode_entry(id, fields).await {
                return Some(delivery);
            }
        }
        None
    }

    async fn decode_all(&self, entries: Vec<crate::store::RawEntry>) -> Vec<Delivery> {
        let mut out = Vec::new();
        for (id, fields) in entries {
            if let Some(delivery) = self.decode_entry(id, fields).await {
                out.push(delivery);
            }
        }
        out
    }

    /// Decodes one raw stream entry. An entry that cannot be turned into a
    /// `Job` is dead-lettered and acknowledged here rather than surfaced —
    /// there is no handler that could ever process it, so leaving it
    /// pending would just mean it gets reclaimed forever.
    async fn decode_entry(&self, entry_id: String, fields: HashMap<String, String>) -> Option<Delivery> {
        let tag = DeliveryTag::new(self.config.stream_name.clone(), entry_id);
        match fields.get("job") {
            Some(raw) => match decode_job(raw) {
                Ok(job) => Some(Delivery::new(tag, job)),
                Err(e) => {
                    warn!(entry_id = %tag.entry_id, error = %e, "undecodable job entry, dead-lettering");
                    if let Err(dlq_err) = self.dead_letter_raw(&tag, &format!("decode error: {e}")).await {
                        error!(entry_id = %tag.entry_id, error = %dlq_err, "failed to dead-letter undecodable entry");
                    }
                    None
                }
            },
            None => {
                warn!(entry_id = %tag.entry_id, "stream entry missing 'job' field, dead-lettering");
                if let Err(dlq_err) = self.dead_letter_raw(&tag, "missing 'job' field").await {
                    error!(entry_id = %tag.entry_id, error = %dlq_err, "failed to dead-letter undecodable entry");
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::FakeStoreClient;
    use serde_json::json;

    fn test_broker() -> Broker {
        let config = BrokerConfig::for_class("demo").with_consumer_id("worker-1");
        Broker::new(Arc::new(FakeStoreClient::default()), config)
    }

    #[tokio::test]
    async fn publish_then_consume_round_trips_the_envelope() {
        let broker = test_broker();
        let job = Job::new("demo.kind", json!({"x": 1}), "corr-1");

        broker.publish(&job).await.unwrap();
        let delivery = broker.consume().await.unwrap().expect("one entry available");

        assert_eq!(delivery.job.id, job.id);
        assert_eq!(delivery.job.kind, "demo.kind");
        assert_eq!(delivery.tag.stream, "demo:jobs");
    }

    #[tokio::test]
    async fn dead_letter_appends_and_acks() {
        let broker = test_broker();
        let job = Job::new("demo.kind", json!({}), "corr-1");
        broker.publish(&job).await.unwrap();
        let delivery = broker.consume().await.unwrap().unwrap();

        broker.dead_letter(&delivery.job, &delivery.tag, "boom").await.unwrap();
    }

    #[tokio::test]
    async fn reclaim_reports_the_real_delivery_count_from_pending_range() {
        let store = Arc::new(FakeStoreClient::default());
        let job = Job::new("demo.kind", json!({"x": 1}), "corr-1");
        let data = encode_job(&job).unwrap();

        store.autoclaim_entries.lock().unwrap().push(("5-0".to_string(), HashMap::from([("job".to_string(), data)])));
        store.pending.lock().unwrap().push(crate::store::PendingEntry {
            entry_id: "5-0".to_string(),
            consumer: "worker-0".to_string(),
            idle_ms: 120_000,
            delivery_count: 4,
        });

        let config = BrokerConfig::for_class("demo").with_consumer_id("worker-1");
        let broker = Broker::new(store, config);

        let claimed = broker.reclaim().await.unwrap();

        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].delivery_count, 4);
    }

    #[tokio::test]
    async fn reclaim_falls_back_to_two_when_pending_range_has_no_entry() {
        let store = Arc::new(FakeStoreClient::default());
        let job = Job::new("demo.kind", json!({"x": 1}), "corr-1");
        let data = encode_job(&job).unwrap();
        store.autoclaim_entries.lock().unwrap().push(("5-0".to_string(), HashMap::from([("job".to_string(), data)])));

        let config = BrokerConfig::for_class("demo").with_consumer_id("worker-1");
        let broker = Broker::new(store, config);

        let claimed = broker.reclaim().await.unwrap();

        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].delivery_count, 2);
    }

    #[tokio::test]
    async fn undecodable_entry_is_dead_lettered_instead_of_dropped() {
        let store = Arc::new(FakeStoreClient::default());
        store.streams.lock().unwrap().insert(
            "demo:jobs".to_string(),
            vec![("1-0".to_string(), HashMap::from([("job".to_string(), "not json".to_string())]))],
        );
        let config = BrokerConfig::for_class("demo").with_consumer_id("worker-1");
        let broker = Broker::new(store.clone(), config);

        let delivery = broker.consume().await.unwrap();
        assert!(delivery.is_none(), "undecodable entry must not surface as a delivery");

        let dlq = store.streams.lock().unwrap().get("demo:dead").cloned().unwrap_or_default();
        assert_eq!(dlq.len(), 1);
        assert!(dlq[0].1.get("error").unwrap().contains("decode error"));
    }
}
