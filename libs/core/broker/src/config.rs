//! Broker / worker runtime configuration.
//!
//! `BrokerConfig` configures one worker class's view of its queue: which
//! stream and consumer group it reads, how it batches and claims abandoned
//! work, and its resilience knobs. `BrokerConfig::from_env` loads the
//! values recognised in the environment-variables table (`WORKER_CLASS`,
//! `WORKER_CONCURRENCY`, `HEARTBEAT_INTERVAL`, `MAX_TASKS_PER_CHILD`).

use core_config::{env_or_default, ConfigError, FromEnv};
use uuid::Uuid;

/// Per-worker-class queue configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Worker class this config belongs to, e.g. `browser`.
    pub class: String,

    /// Stream this worker class consumes from.
    pub stream_name: String,

    /// Consumer group name.
    pub consumer_group: String,

    /// Unique consumer ID (auto-generated if not provided).
    pub consumer_id: String,

    /// Dead-letter stream name (`<class>:dead` by default).
    pub dlq_stream: String,

    /// Maximum stream length before approximate trimming.
    pub max_length: i64,

    /// Poll interval in milliseconds when no messages are available.
    pub poll_interval_ms: u64,

    /// Batch size for reading messages.
    pub batch_size: usize,

    /// Blocking read timeout in milliseconds (`None` = non-blocking).
    pub blocking_timeout_ms: Option<u64>,

    /// Maximum concurrent jobs to process within this worker process.
    pub max_concurrent_jobs: usize,

    /// Minimum idle time, in milliseconds, before a pending entry is
    /// eligible for `reclaim` by another consumer. Open question (b) in
    /// the design notes; resolved and recorded in DESIGN.md.
    pub min_idle_ms: u64,

    /// Maximum retries before dead-lettering.
    pub max_retries: u32,

    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: u64,

    /// Jobs processed by a session before it is torn down and recreated.
    pub max_tasks_per_child: u32,

    pub enable_circuit_breaker: bool,
    pub enable_rate_limiter: bool,
    pub rate_limit_rps: f64,
}

impl BrokerConfig {
    /// Build the default queue configuration for a worker class, following
    /// the stream naming convention in §6: `<class>:jobs`, `<class>:dead`.
    pub fn for_class(class: impl Into<String>) -> Self {
        let class = class.into();
        Self {
            stream_name: format!("{class}:jobs"),
            dlq_stream: format!("{class}:dead"),
            consumer_group: format!("{class}_workers"),
            consumer_id: format!("worker-{}", Uuid::new_v4()),
            max_length: 100_000,
            poll_interval_ms: 1_000,
            batch_size: 10,
            blocking_timeout_ms: Some(1_000),
            max_concurrent_jobs: 1,
            min_idle_ms: 60_000,
            max_retries: 3,
            heartbeat_interval_ms: 30_000,
            max_tasks_per_child: 1_000,
            enable_circuit_breaker: true,
            enable_rate_limiter: false,
            rate_limit_rps: 100.0,
            class,
        }
    }

    pub fn with_consumer_id(mut self, id: impl Into<String>) -> Self {
        self.consumer_id = id.into();
        self
    }

    pub fn with_max_length(mut self, max_length: i64) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn with_poll_interval_ms(mut self, interval: u64) -> Self {
        self.poll_interval_ms = interval;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_blocking(mut self, timeout_ms: Option<u64>) -> Self {
        self.blocking_timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_concurrent_jobs(mut self, count: usize) -> Self {
        self.max_concurrent_jobs = count.max(1);
        self
    }

    pub fn with_min_idle_ms(mut self, min_idle_ms: u64) -> Self {
        self.min_idle_ms = min_idle_ms;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_heartbeat_interval_ms(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    pub fn with_max_tasks_per_child(mut self, count: u32) -> Self {
        self.max_tasks_per_child = count;
        self
    }

    pub fn with_circuit_breaker(mut self, enable: bool) -> Self {
        self.enable_circuit_breaker = enable;
        self
    }

    pub fn with_rate_limiter(mut self, enable: bool, rps: f64) -> Self {
        self.enable_rate_limiter = enable;
        self.rate_limit_rps = rps;
        self
    }
}

impl FromEnv for BrokerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let class = env_or_default("WORKER_CLASS", "default");
        let mut config = Self::for_class(class);

        if let Ok(concurrency) = std::env::var("WORKER_CONCURRENCY") {
            config.max_concurrent_jobs =
                concurrency
                    .parse()
                    .map_err(|e| ConfigError::ParseError {
                        key: "WORKER_CONCURRENCY".to_string(),
                        details: format!("{e}"),
                    })?;
        }

        if let Ok(interval) = std::env::var("HEARTBEAT_INTERVAL") {
            let seconds: u64 = interval.parse().map_err(|e| ConfigError::ParseError {
                key: "HEARTBEAT_INTERVAL".to_string(),
                details: format!("{e}"),
            })?;
            config.heartbeat_interval_ms = seconds * 1_000;
        }

        if let Ok(max_tasks) = std::env::var("MAX_TASKS_PER_CHILD") {
            config.max_tasks_per_child =
                max_tasks
                    .parse()
                    .map_err(|e| ConfigError::ParseError {
                        key: "MAX_TASKS_PER_CHILD".to_string(),
                        details: format!("{e}"),
                    })?;
        }

        Ok(config)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::for_class("default")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_stream_names_from_class() {
        let config = BrokerConfig::for_class("browser");
        assert_eq!(config.stream_name, "browser:jobs");
        assert_eq!(config.dlq_stream, "browser:dead");
        assert_eq!(config.consumer_group, "browser_workers");
        assert!(config.consumer_id.starts_with("worker-"));
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = BrokerConfig::for_class("browser")
            .with_consumer_id("worker-1")
            .with_batch_size(20)
            .with_max_concurrent_jobs(4)
            .with_blocking(Some(10_000))
            .with_min_idle_ms(90_000);

        assert_eq!(config.consumer_id, "worker-1");
        assert_eq!(config.batch_size, 20);
        assert_eq!(config.max_concurrent_jobs, 4);
        assert_eq!(config.blocking_timeout_ms, Some(10_000));
        assert_eq!(config.min_idle_ms, 90_000);
    }

    #[test]
    fn from_env_reads_worker_class() {
        temp_env::with_vars(
            [
                ("WORKER_CLASS", Some("browser")),
                ("WORKER_CONCURRENCY", Some("8")),
                ("HEARTBEAT_INTERVAL", Some("15")),
            ],
            || {
                let config = BrokerConfig::from_env().unwrap();
                assert_eq!(config.class, "browser");
                assert_eq!(config.max_concurrent_jobs, 8);
                assert_eq!(config.heartbeat_interval_ms, 15_000);
            },
        );
    }
}
