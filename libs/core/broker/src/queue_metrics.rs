//! Queue metrics (§4.C): a cheap approximation of unfinished work per
//! `(queue, group)`, distinct from raw stream length. Raw `stream_length`
//! is monotonic and dominated by history; pending alone under-reports
//! demand; their sum is the best cheap approximation the autoscaler reads.

use crate::error::BrokerResult;
use crate::store::StoreClient;

/// Threshold past which an oldest-pending entry is treated as evidence of
/// a starved consumer, doubling the reported pressure (§4.C).
pub const STUCK_PENDING_THRESHOLD_MS: u64 = 30_000;

/// Computed queue-metrics snapshot for a `(queue, group)` pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueMetrics {
    pub stream_length: u64,
    pub pending_count: u64,
    pub oldest_pending_age_ms: u64,
    pub new_estimate: u64,
    /// `pending_count + new_estimate`, doubled if `oldest_pending_age_ms`
    /// exceeds [`STUCK_PENDING_THRESHOLD_MS`]. This is the value the
    /// scaling service (§4.F) reads.
    pub true_depth: u64,
}

/// Computes [`QueueMetrics`] for `stream`/`group` against any
/// [`StoreClient`] (a direct backend or the resilient fallback composite).
pub async fn compute(store: &dyn StoreClient, stream: &str, group: &str) -> BrokerResult<QueueMetrics> {
    let stream_length = store.len(stream).await?;
    let summary = store.pending_summary(stream, group).await?;
    let pending_count = summary.count;

    let oldest_pending_age_ms = if pending_count > 0 {
        let oldest = store.pending_range(stream, group, 0, 1).await?;
        oldest.first().map(|entry| entry.idle_ms).unwrap_or(0)
    } else {
        0
    };

    let new_estimate = stream_length.saturating_sub(pending_count);
    let raw_depth = pending_count + new_estimate;
    let true_depth = if oldest_pending_age_ms > STUCK_PENDING_THRESHOLD_MS {
        raw_depth * 2
    } else {
        raw_depth
    };

    Ok(QueueMetrics {
        stream_length,
        pending_count,
        oldest_pending_age_ms,
        new_estimate,
        true_depth,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::FakeStoreClient;

    #[tokio::test]
    async fn true_depth_is_pending_plus_new() {
        let store = FakeStoreClient::default();
        store.append("q:jobs", &[("job", "{}")], None).await.unwrap();
        store.append("q:jobs", &[("job", "{}")], None).await.unwrap();

        let metrics = compute(&store, "q:jobs", "q_workers").await.unwrap();

        assert_eq!(metrics.stream_length, 2);
        assert_eq!(metrics.pending_count, 0);
        assert_eq!(metrics.new_estimate, 2);
        assert_eq!(metrics.true_depth, 2);
    }

    #[test]
    fn invariant_true_depth_never_below_pending() {
        let metrics = QueueMetrics {
            stream_length: 5,
            pending_count: 3,
            oldest_pending_age_ms: 0,
            new_estimate: 2,
            true_depth: 5,
        };
        assert!(metrics.true_depth >= metrics.pending_count);
    }
}
