//! Scaling events (§4.F/§6): the append-only audit trail of every scaling
//! decision, written to the `scaling:events` stream. The scaling service is
//! documented (§5) as the sole writer for a given class at a given time.

use broker::error::{BrokerError, BrokerResult};
use broker::store::StoreClient;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const SCALING_EVENTS_STREAM: &str = "scaling:events";

/// Why a tick did or didn't change replica count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingReason {
    ScaleUp,
    ScaleDown,
    Hold,
    Error,
}

impl ScalingReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ScaleUp => "scale_up",
            Self::ScaleDown => "scale_down",
            Self::Hold => "hold",
            Self::Error => "error",
        }
    }
}

/// One scaling decision, whether or not it changed the replica count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingEvent {
    pub class: String,
    pub reason: ScalingReason,
    pub true_depth: u64,
    pub previous_replicas: u32,
    pub target_replicas: u32,
    pub observed_replicas: Option<u32>,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

impl ScalingEvent {
    pub fn hold(class: impl Into<String>, true_depth: u64, current: u32) -> Self {
        Self {
            class: class.into(),
            reason: ScalingReason::Hold,
            true_depth,
            previous_replicas: current,
            target_replicas: current,
            observed_replicas: Some(current),
            error: None,
            at: Utc::now(),
        }
    }

    pub fn error(class: impl Into<String>, true_depth: u64, current: u32, error: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            reason: ScalingReason::Error,
            true_depth,
            previous_replicas: current,
            target_replicas: current,
            observed_replicas: None,
            error: Some(error.into()),
            at: Utc::now(),
        }
    }

    /// Appends this event to [`SCALING_EVENTS_STREAM`].
    pub async fn append(&self, store: &dyn StoreClient) -> BrokerResult<String> {
        let data = serde_json::to_string(self).map_err(BrokerError::Serialization)?;
        store.append(SCALING_EVENTS_STREAM, &[("event", &data)], Some(10_000)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_as_str_matches_serde_rename() {
        assert_eq!(ScalingReason::ScaleUp.as_str(), "scale_up");
        let json = serde_json::to_string(&ScalingReason::ScaleUp).unwrap();
        assert_eq!(json, "\"scale_up\"");
    }
}
