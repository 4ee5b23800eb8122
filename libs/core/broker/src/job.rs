//! The job and result envelopes, and the traits a job kind must implement
//! to be processed by the worker runtime.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BrokerError;

/// Immutable envelope produced by front-ends and carried end to end through
/// the broker. `payload` is opaque to the core; only `kind` is inspected to
/// resolve a queue and a handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: String,
    pub payload: Value,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    pub correlation: String,
    #[serde(default)]
    pub reply_stream: Option<String>,
}

impl Job {
    pub fn new(kind: impl Into<String>, payload: Value, correlation: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: kind.into(),
            payload,
            submitted_at: Utc::now(),
            retry_count: 0,
            correlation: correlation.into(),
            reply_stream: None,
        }
    }

    pub fn with_reply_stream(mut self, reply_stream: impl Into<String>) -> Self {
        self.reply_stream = Some(reply_stream.into());
        self
    }

    /// Queue name resolved from `kind`'s prefix, e.g. `browser.navigate` -> `browser`.
    pub fn queue_name(&self) -> &str {
        self.kind.split('.').next().unwrap_or(&self.kind)
    }
}

/// Result status, matching the three terminal outcomes a handler can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Ok,
    TransientError,
    PermanentError,
}

/// Produced by a worker after attempting a job, published back via the
/// broker's `reply` operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub status: ResultStatus,
    pub payload: Value,
    pub error: Option<String>,
    pub attempt: u32,
    pub worker_id: String,
    pub finished_at: DateTime<Utc>,
    pub correlation: String,
}

impl JobResult {
    pub fn ok(job: &Job, worker_id: impl Into<String>, payload: Value, attempt: u32) -> Self {
        Self {
            job_id: job.id.clone(),
            status: ResultStatus::Ok,
            payload,
            error: None,
            attempt,
            worker_id: worker_id.into(),
            finished_at: Utc::now(),
            correlation: job.correlation.clone(),
        }
    }

    pub fn failure(
        job: &Job,
        worker_id: impl Into<String>,
        status: ResultStatus,
        error: impl Into<String>,
        attempt: u32,
    ) -> Self {
        Self {
            job_id: job.id.clone(),
            status,
            payload: Value::Null,
            error: Some(error.into()),
            attempt,
            worker_id: worker_id.into(),
            finished_at: Utc::now(),
            correlation: job.correlation.clone(),
        }
    }
}

/// Outcome a handler reports for a single job attempt. Distinct from
/// [`ResultStatus`]: this is the handler-facing contract, translated into a
/// [`JobResult`] and a broker ack/no-ack/dead-letter decision by the worker
/// loop.
pub enum HandlerOutcome {
    Ok(Value),
    Transient(String),
    Permanent(String),
}

/// A per-kind capability handler. Declares the job kinds it accepts and
/// processes a decoded job against a session bag entry of its own choosing.
///
/// Handlers are registered in a [`crate::worker::HandlerRegistry`] keyed by
/// `kind()`; dispatch extracts nothing from the payload on the handler's
/// behalf beyond what `process` reads itself, so additional envelope fields
/// are tolerated for forward compatibility.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The `job.kind` this handler accepts, e.g. `browser.navigate`.
    fn kind(&self) -> &str;

    /// Process one job. `session` is this worker's per-kind session bag
    /// entry, lazily created on first use and reused across jobs of the
    /// same kind for the life of the process.
    async fn process(&self, job: &Job, session: &mut Session) -> HandlerOutcome;

    /// Maximum delivery attempts before dead-lettering (default 3, i.e. up
    /// to 4 total handler invocations including the first).
    fn max_retries(&self) -> u32 {
        3
    }
}

/// Opaque per-kind resource bag held by the worker across jobs of the same
/// kind, e.g. a browser tab or an LLM context. A handler downcasts the
/// boxed value to its own session type on each call.
#[derive(Default)]
pub struct Session {
    inner: Option<Box<dyn std::any::Any + Send>>,
}

impl Session {
    pub fn get_or_insert_with<T: Send + 'static>(&mut self, init: impl FnOnce() -> T) -> &mut T {
        if self.inner.is_none() {
            self.inner = Some(Box::new(init()));
        }
        self.inner
            .as_mut()
            .unwrap()
            .downcast_mut::<T>()
            .expect("session type mismatch for this job kind")
    }

    pub fn teardown(&mut self) {
        self.inner = None;
    }

    pub fn is_active(&self) -> bool {
        self.inner.is_some()
    }
}

pub fn exceeded_max_retries(job: &Job, max_retries: u32) -> bool {
    job.retry_count >= max_retries
}

pub fn decode_job(data: &str) -> Result<Job, BrokerError> {
    serde_json::from_str(data).map_err(BrokerError::Serialization)
}

pub fn encode_job(job: &Job) -> Result<String, BrokerError> {
    serde_json::to_string(job).map_err(BrokerError::Serialization)
}
