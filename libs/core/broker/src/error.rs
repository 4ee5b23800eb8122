//! Error types for the broker, store client, and worker runtime.

use thiserror::Error;

/// Errors surfaced by the resilient store client, the broker, and the worker loop.
///
/// Variant names mirror the error kinds named in the control-plane design:
/// store errors are split into transient (retry, do not acknowledge) and
/// permanent (fatal to the calling loop); decode and handler errors are
/// split the same way.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Network, rate-limit, or timeout talking to the store. Retry with
    /// back-off; never acknowledge the delivery that produced it.
    #[error("transient store error: {0}")]
    TransientStore(String),

    /// Malformed command or authentication failure. Fatal to the worker
    /// loop that raised it.
    #[error("permanent store error: {0}")]
    PermanentStore(String),

    /// The job envelope could not be decoded. Acknowledged immediately and
    /// reported as a permanent failure; never retried.
    #[error("job decode error: {0}")]
    JobDecode(String),

    /// A handler reported a recoverable failure.
    #[error("handler transient error: {0}")]
    HandlerTransient(String),

    /// A handler reported an unrecoverable failure.
    #[error("handler permanent error: {0}")]
    HandlerPermanent(String),

    /// No handler is registered for the job's `kind`.
    #[error("unknown job kind: {0}")]
    UnknownKind(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("consumer group error: {0}")]
    ConsumerGroup(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("health check failed: {0}")]
    HealthCheck(String),
}

/// Broad failure category used to decide retry behaviour and metrics labels.
///
/// Distinct from [`BrokerError`]'s specific variants: a single error kind
/// (e.g. `Redis`) is classified at the point it's handled, based on its
/// text and context, into one of these buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Worth retrying: network blips, timeouts, rate limiting.
    Transient,
    /// Never worth retrying: bad input, auth failure, decode failure.
    Permanent,
}

impl ErrorCategory {
    pub fn should_retry(&self) -> bool {
        matches!(self, ErrorCategory::Transient)
    }
}

impl BrokerError {
    /// Classify this error for retry purposes.
    pub fn category(&self) -> ErrorCategory {
        match self {
            BrokerError::TransientStore(_) | BrokerError::HandlerTransient(_) => {
                ErrorCategory::Transient
            }
            BrokerError::PermanentStore(_)
            | BrokerError::JobDecode(_)
            | BrokerError::HandlerPermanent(_)
            | BrokerError::UnknownKind(_)
            | BrokerError::ConsumerGroup(_)
            | BrokerError::Queue(_)
            | BrokerError::Serialization(_) => ErrorCategory::Permanent,
            BrokerError::Redis(e) => classify_redis_error(e),
            BrokerError::HealthCheck(_) => ErrorCategory::Transient,
        }
    }

    pub fn is_connection_error(&self) -> bool {
        match self {
            BrokerError::Redis(e) => e.is_connection_dropped() || e.is_timeout(),
            BrokerError::TransientStore(_) => true,
            _ => false,
        }
    }

    pub fn is_nogroup_error(&self) -> bool {
        matches!(self, BrokerError::Redis(e) if e.to_string().to_uppercase().contains("NOGROUP"))
    }

    pub fn is_rate_limited(&self) -> bool {
        let text = self.to_string().to_lowercase();
        text.contains("rate") || text.contains("429") || text.contains("too many")
    }
}

fn classify_redis_error(e: &redis::RedisError) -> ErrorCategory {
    if e.is_connection_dropped() || e.is_timeout() || e.is_io_error() {
        return ErrorCategory::Transient;
    }
    let text = e.to_string().to_lowercase();
    if text.contains("rate") || text.contains("loading") || text.contains("busy") {
        return ErrorCategory::Transient;
    }
    ErrorCategory::Permanent
}

pub type BrokerResult<T> = Result<T, BrokerError>;
