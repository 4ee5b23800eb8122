//! Per-worker-class scaling policy (§4.F).

use std::time::Duration;

/// Thresholds and bounds driving the scaling algorithm for one worker class.
#[derive(Debug, Clone)]
pub struct WorkerClassConfig {
    pub class: String,
    /// Stream/group this class's queue metrics are read from.
    pub queue_stream: String,
    pub consumer_group: String,
    pub min_replicas: u32,
    pub max_replicas: u32,
    /// `true_depth` at or above which the class scales up.
    pub scale_up_threshold: u64,
    /// `true_depth` at or below which the class scales down.
    pub scale_down_threshold: u64,
    pub cooldown: Duration,
    /// Replicas removed per tick when scaling down. Defaults to 1 (§4.F).
    pub step_down: u32,
    pub enabled: bool,
}

impl WorkerClassConfig {
    pub fn new(class: impl Into<String>) -> Self {
        let class = class.into();
        let queue_stream = format!("{class}:jobs");
        let consumer_group = format!("{class}_workers");
        Self {
            class,
            queue_stream,
            consumer_group,
            min_replicas: 0,
            max_replicas: 10,
            scale_up_threshold: 50,
            scale_down_threshold: 5,
            cooldown: Duration::from_secs(120),
            step_down: 1,
            enabled: true,
        }
    }

    pub fn with_replica_bounds(mut self, min: u32, max: u32) -> Self {
        self.min_replicas = min;
        self.max_replicas = max;
        self
    }

    pub fn with_thresholds(mut self, scale_up: u64, scale_down: u64) -> Self {
        self.scale_up_threshold = scale_up;
        self.scale_down_threshold = scale_down;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_step_down(mut self, step_down: u32) -> Self {
        self.step_down = step_down.max(1);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// `ceil(true_depth / scale_up_threshold)`, capped by remaining headroom
    /// to `max_replicas` (§4.F).
    pub fn step_up(&self, true_depth: u64, current: u32) -> u32 {
        if self.scale_up_threshold == 0 {
            return 1;
        }
        let raw = true_depth.div_ceil(self.scale_up_threshold).max(1);
        let headroom = self.max_replicas.saturating_sub(current) as u64;
        raw.min(headroom) as u32
    }
}
