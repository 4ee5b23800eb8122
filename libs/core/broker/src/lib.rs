//! Queue broker, worker runtime, and resilient store client for a
//! distributed task-execution control plane.
//!
//! - [`store`] — the resilient store client: a narrow command surface over
//!   streams/hashes/pub-sub, implemented directly against the primary
//!   backend or wrapped in a rate-limit/circuit-breaker fallback composite.
//! - [`broker`] — produce/consume/ack/reclaim/dead-letter on a worker
//!   class's queue, built on [`store::StoreClient`].
//! - [`queue_metrics`] — the `true_depth` queue-pressure estimate the
//!   scaling service reads.
//! - [`worker`] — the worker runtime: state machine, handler dispatch,
//!   session lifecycle, retry policy, heartbeat.
//! - [`dlq`] — dead-letter queue administration (list/get/delete/purge/reprocess).
//! - [`health`] — the HTTP health/metrics/admin surface shared by the
//!   worker and control-plane binaries.
//! - [`resilience`] — circuit breaker and token-bucket rate limiter.
//! - [`metrics`] — Prometheus metric names and recording helpers.
//! - [`config`] — [`config::BrokerConfig`], per-worker-class queue configuration.
//! - [`job`] — the [`job::Job`]/[`job::JobResult`] envelopes and the
//!   [`job::JobHandler`] trait a capability implements.
//! - [`event`] — [`event::Delivery`]/[`event::DeliveryTag`], the consume-side
//!   wrapper around a job.
//! - [`error`] — [`error::BrokerError`] and [`error::ErrorCategory`].

pub mod broker;
pub mod config;
pub mod dlq;
pub mod error;
pub mod event;
pub mod health;
pub mod job;
pub mod metrics;
pub mod queue_metrics;
pub mod resilience;
pub mod store;
pub mod worker;

pub use broker::Broker;
pub use config::BrokerConfig;
pub use dlq::{DlqEntry, DlqManager, DlqStats};
pub use error::{BrokerError, BrokerResult, ErrorCategory};
pub use event::{Delivery, DeliveryTag};
pub use health::{dlq_admin_router, worker_health_router, DlqAdminState, WorkerHealthState};
pub use job::{HandlerOutcome, Job, JobHandler, JobResult, ResultStatus, Session};
pub use queue_metrics::QueueMetrics;
pub use resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, RateLimiter, ResilienceError,
    ResilienceLayer,
};
pub use store::{FallbackConfig, FallbackStoreClient, RedisStoreClient, StoreClient, StoreEvent};
pub use worker::{HandlerRegistry, SharedStatus, StatusSnapshot, WorkerRuntime, WorkerState};
