//! Delivery wrapper: a job plus the stream metadata from the delivery that
//! produced it.

use chrono::{DateTime, Utc};

use crate::job::Job;

/// Opaque identifier for a single delivery, carried from `consume` through
/// to `ack`/`reclaim`/`dead_letter`. Corresponds to the spec's
/// `delivery_tag = (stream, entry_id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryTag {
    pub stream: String,
    pub entry_id: String,
}

impl DeliveryTag {
    pub fn new(stream: impl Into<String>, entry_id: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            entry_id: entry_id.into(),
        }
    }
}

/// A job as delivered by the broker, carrying its delivery tag and how many
/// times this entry has been delivered so far (1 = first delivery).
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub job: Job,
    pub delivered_at: DateTime<Utc>,
    pub delivery_count: u32,
}

impl Delivery {
    pub fn new(tag: DeliveryTag, job: Job) -> Self {
        let delivered_at = Self::parse_timestamp(&tag.entry_id);
        Self {
            tag,
            job,
            delivered_at,
            delivery_count: 1,
        }
    }

    pub fn with_delivery_count(tag: DeliveryTag, job: Job, delivery_count: u32) -> Self {
        let delivered_at = Self::parse_timestamp(&tag.entry_id);
        Self {
            tag,
            job,
            delivered_at,
            delivery_count,
        }
    }

    /// Stream entry IDs are `timestamp_ms-sequence`.
    fn parse_timestamp(entry_id: &str) -> DateTime<Utc> {
        entry_id
            .split('-')
            .next()
            .and_then(|ts| ts.parse::<i64>().ok())
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(Utc::now)
    }

    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }

    pub fn age_ms(&self) -> i64 {
        (Utc::now() - self.delivered_at).num_milliseconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_timestamp_from_entry_id() {
        let now_ms = Utc::now().timestamp_millis();
        let tag = DeliveryTag::new("jobs", format!("{now_ms}-0"));
        let job = Job::new("demo.kind", serde_json::json!({}), "corr-1");

        let delivery = Delivery::new(tag, job);
        assert!(delivery.age_ms() < 1_000);
        assert!(!delivery.is_redelivery());
    }

    #[test]
    fn redelivery_flag_tracks_delivery_count() {
        let tag = DeliveryTag::new("jobs", "1234567890123-0");
        let job = Job::new("demo.kind", serde_json::json!({}), "corr-1");

        let delivery = Delivery::with_delivery_count(tag, job, 3);
        assert!(delivery.is_redelivery());
        assert_eq!(delivery.delivery_count, 3);
    }
}
