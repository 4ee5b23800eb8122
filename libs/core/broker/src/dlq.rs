//! Dead-letter queue administration.
//!
//! [`crate::broker::Broker::dead_letter`] is the write path, invoked by the
//! worker runtime once `retry_count ≥ max_retries`. This module is the
//! read/admin surface over the same `<queue>:dead` stream: listing,
//! inspecting, purging, and reprocessing entries — the library half of the
//! control-plane's `reprocess-deadletter` orchestrator command (§4.H).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{BrokerError, BrokerResult};
use crate::job::Job;
use crate::store::StoreClient;

/// Dead-letter queue manager bound to one stream.
pub struct DlqManager {
    store: Arc<dyn StoreClient>,
    dlq_stream: String,
    max_length: i64,
}

impl DlqManager {
    pub fn new(store: Arc<dyn StoreClient>, dlq_stream: impl Into<String>) -> Self {
        Self {
            store,
            dlq_stream: dlq_stream.into(),
            max_length: 10_000,
        }
    }

    pub fn with_max_length(mut self, max_length: i64) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn dlq_stream(&self) -> &str {
        &self.dlq_stream
    }

    /// Appends a job directly to the dead-letter stream. Exposed for
    /// callers outside the normal broker consume loop (e.g. an admin
    /// command dead-lettering a job by hand); the broker's own
    /// `dead_letter` path appends inline rather than going through here.
    pub async fn append(&self, job: &Job, error: &str, original_entry_id: &str) -> BrokerResult<String> {
        let entry = DlqEntry {
            job_id: job.id.clone(),
            job_data: serde_json::to_value(job).map_err(BrokerError::Serialization)?,
            error: error.to_string(),
            original_entry_id: original_entry_id.to_string(),
            retry_count: job.retry_count,
            failed_at: Utc::now(),
        };
        let data = serde_json::to_string(&entry).map_err(BrokerError::Serialization)?;

        let dlq_id = self
            .store
            .append(&self.dlq_stream, &[("data", &data)], Some(self.max_length))
            .await?;

        info!(job_id = %job.id, dlq_id = %dlq_id, error, "moved job to dead-letter queue");
        Ok(dlq_id)
    }

    /// Dead-letter queue depth and ID range.
    pub async fn stats(&self) -> BrokerResult<DlqStats> {
        let length = self.store.len(&self.dlq_stream).await?;
        let oldest = self.store.range(&self.dlq_stream, "-", "+", 1).await?;
        let newest = self.store.revrange(&self.dlq_stream, "-", "+", 1).await?;

        Ok(DlqStats {
            stream_name: self.dlq_stream.clone(),
            length,
            oldest_entry_id: oldest.first().map(|(id, _)| id.clone()),
            newest_entry_id: newest.first().map(|(id, _)| id.clone()),
        })
    }

    /// Lists up to `count` entries starting from `start` (exclusive lower
    /// bound, `-` for the beginning of the stream).
    pub async fn list(&self, count: usize, start: Option<&str>) -> BrokerResult<Vec<(String, DlqEntry)>> {
        let entries = self
            .store
            .range(&self.dlq_stream, start.unwrap_or("-"), "+", count)
            .await?;

        Ok(entries
            .into_iter()
            .filter_map(|(id, fields)| {
                fields
                    .get("data")
                    .and_then(|data| serde_json::from_str::<DlqEntry>(data).ok())
                    .map(|entry| (id, entry))
            })
            .collect())
    }

    /// Fetches one entry by its dead-letter stream entry ID.
    pub async fn get(&self, dlq_id: &str) -> BrokerResult<Option<DlqEntry>> {
        let entries = self.store.range(&self.dlq_stream, dlq_id, dlq_id, 1).await?;
        Ok(entries
            .first()
            .and_then(|(_, fields)| fields.get("data"))
            .and_then(|data| serde_json::from_str(data).ok()))
    }

    /// Permanently removes one entry without reprocessing it.
    pub async fn delete(&self, dlq_id: &str) -> BrokerResult<bool> {
        let deleted = self.store.delete_entries(&self.dlq_stream, &[dlq_id.to_string()]).await?;
        debug!(dlq_id, "deleted dead-letter entry");
        Ok(deleted > 0)
    }

    /// Republishes every entry currently in the dead-letter stream back
    /// onto `target_stream`, returning how many were requeued. Backs the
    /// orchestrator's `reprocess-deadletter <queue>` command (§4.H), which
    /// operates on the whole queue rather than one entry at a time.
    pub async fn reprocess_all(&self, target_stream: &str, reset_retry_count: bool) -> BrokerResult<u64> {
        let mut requeued = 0u64;
        loop {
            let batch = self.list(100, None).await?;
            if batch.is_empty() {
                break;
            }
            for (dlq_id, _) in &batch {
                if self.reprocess(dlq_id, target_stream, reset_retry_count).await?.is_some() {
                    requeued += 1;
                }
            }
        }
        info!(count = requeued, stream = %self.dlq_stream, "reprocessed entire dead-letter queue");
        Ok(requeued)
    }

    /// Discards every entry in the dead-letter stream, returning how many
    /// were dropped.
    pub async fn purge(&self) -> BrokerResult<u64> {
        let len = self.store.len(&self.dlq_stream).await?;
        if len > 0 {
            self.store.trim(&self.dlq_stream, 0).await?;
            info!(count = len, stream = %self.dlq_stream, "purged dead-letter queue");
        }
        Ok(len)
    }

    /// Republishes one dead-lettered job back onto `target_stream` and
    /// removes it from the dead-letter stream. `reset_retry_count`
    /// controls whether the job's `retry_count` is zeroed before
    /// republishing — decision (c) in DESIGN.md.
    pub async fn reprocess(
        &self,
        dlq_id: &str,
        target_stream: &str,
        reset_retry_count: bool,
    ) -> BrokerResult<Option<String>> {
        let Some(entry) = self.get(dlq_id).await? else {
            return Ok(None);
        };

        let mut job: Job = serde_json::from_value(entry.job_data).map_err(BrokerError::Serialization)?;
        if reset_retry_count {
            job.retry_count = 0;
        }
        let data = serde_json::to_string(&job).map_err(BrokerError::Serialization)?;

        let new_id = self.store.append(target_stream, &[("job", &data)], None).await?;
        self.delete(dlq_id).await?;

        info!(job_id = %job.id, dlq_id, new_entry_id = %new_id, "reprocessed dead-lettered job");
        Ok(Some(new_id))
    }
}

impl Clone for DlqManager {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            dlq_stream: self.dlq_stream.clone(),
            max_length: self.max_length,
        }
    }
}

/// One dead-letter stream entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub job_id: String,
    pub job_data: serde_json::Value,
    pub error: String,
    pub original_entry_id: String,
    pub retry_count: u32,
    pub failed_at: DateTime<Utc>,
}

/// Dead-letter queue statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqStats {
    pub stream_name: String,
    pub length: u64,
    pub oldest_entry_id: Option<String>,
    pub newest_entry_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::FakeStoreClient;
    use serde_json::json;

    fn manager() -> DlqManager {
        DlqManager::new(Arc::new(FakeStoreClient::default()), "demo:dead")
    }

    #[tokio::test]
    async fn append_then_list_round_trips() {
        let dlq = manager();
        let job = Job::new("demo.kind", json!({}), "corr-1");

        dlq.append(&job, "boom", "1-0").await.unwrap();
        let entries = dlq.list(10, None).await.unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1.job_id, job.id);
        assert_eq!(entries[0].1.error, "boom");
    }

    #[tokio::test]
    async fn reprocess_removes_from_dlq_and_republishes() {
        let dlq = manager();
        let mut job = Job::new("demo.kind", json!({}), "corr-1");
        job.retry_count = 3;
        dlq.append(&job, "boom", "1-0").await.unwrap();

        let (dlq_id, _) = dlq.list(10, None).await.unwrap().into_iter().next().unwrap();
        let new_id = dlq.reprocess(&dlq_id, "demo:jobs", true).await.unwrap();

        assert!(new_id.is_some());
        assert!(dlq.get(&dlq_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reprocess_all_requeues_every_entry_and_empties_the_dlq() {
        let dlq = manager();
        for i in 0..3 {
            let job = Job::new("demo.kind", json!({"i": i}), "corr-1");
            dlq.append(&job, "boom", "1-0").await.unwrap();
        }

        let requeued = dlq.reprocess_all("demo:jobs", false).await.unwrap();

        assert_eq!(requeued, 3);
        assert_eq!(dlq.stats().await.unwrap().length, 0);
    }
}
