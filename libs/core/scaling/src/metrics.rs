//! Scaling-specific Prometheus metrics (§10), extending the worker/queue
//! metrics this codebase already records (`broker::metrics`) with the
//! scaling service's own gauges and counters.

use metrics::{counter, gauge, histogram};

pub mod names {
    pub const REPLICAS: &str = "scaling_replicas";
    pub const EVENTS_TOTAL: &str = "scaling_events_total";
    pub const DECISION_DURATION: &str = "scaling_decision_duration_seconds";
}

/// Updates the observed-replica-count gauge for `class`.
pub fn set_replicas(class: &str, replicas: f64) {
    gauge!(names::REPLICAS, "class" => class.to_string()).set(replicas);
}

/// Records one scaling decision by reason (`scale_up`, `scale_down`, `hold`, `error`).
pub fn record_event(class: &str, reason: &str) {
    counter!(
        names::EVENTS_TOTAL,
        "class" => class.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Records the wall-clock time a single class's tick took to decide and
/// (optionally) apply a scaling change.
pub fn record_decision_duration(class: &str, duration: std::time::Duration) {
    histogram!(names::DECISION_DURATION, "class" => class.to_string()).record(duration.as_secs_f64());
}
