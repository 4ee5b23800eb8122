//! Scaling backend contract (§4.E): `list`/`scale`/`health` over whatever
//! actually runs worker processes. Every implementation must be idempotent
//! (re-issuing `scale(target)` at the current replica count is a no-op),
//! bounded (`target > max_replicas` is refused before any command runs),
//! and observable (the caller is expected to record a [`crate::event::ScalingEvent`]
//! around every call, which is why `scale` returns the observed replica
//! count rather than `()`).

use async_trait::async_trait;
use thiserror::Error;

/// Failure classification a scaling backend must produce so the service
/// loop (§4.F) knows whether to retry on the next tick or hold.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScalingError {
    #[error("retryable backend failure: {0}")]
    Retryable(String),
    #[error("permanent backend failure: {0}")]
    Permanent(String),
    #[error("refused: target {target} exceeds max_replicas {max_replicas}")]
    OutOfBounds { target: u32, max_replicas: u32 },
}

impl ScalingError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

pub type ScalingResult<T> = Result<T, ScalingError>;

/// Backend health, reported independently of any particular class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendHealth {
    Ok,
    Degraded,
}

/// Uniform, runtime-checkable contract over a fleet of worker processes for
/// one class. `list`/`scale` are keyed by `class` rather than bound to one
/// class per backend instance, since a single container daemon, cluster, or
/// cloud fleet typically hosts every class.
#[async_trait]
pub trait ScalingBackend: Send + Sync {
    /// Currently observed replica count for `class`.
    async fn list(&self, class: &str) -> ScalingResult<u32>;

    /// Drives `class` to `target` replicas, returning the replica count
    /// actually observed afterwards (which may differ from `target` if the
    /// backend could only make partial progress).
    async fn scale(&self, class: &str, target: u32) -> ScalingResult<u32>;

    /// Backend-wide health, independent of any particular class.
    async fn health(&self) -> BackendHealth;
}
