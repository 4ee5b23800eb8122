//! A minimal demonstration handler so the worker binary has at least one
//! registered job kind out of the box. Concrete job payloads (browser
//! automation, LLM calls, etc.) are out of scope here; operators register
//! their own [`broker::job::JobHandler`] implementations in [`crate::run`]
//! alongside or instead of this one.

use async_trait::async_trait;
use broker::job::{HandlerOutcome, Job, JobHandler, Session};
use tracing::debug;

/// Echoes the job payload back as its result. Used to exercise the broker
/// end to end (publish, consume, ack, reply) without depending on any
/// concrete job semantics.
pub struct EchoHandler;

#[async_trait]
impl JobHandler for EchoHandler {
    fn kind(&self) -> &str {
        "demo.echo"
    }

    async fn process(&self, job: &Job, session: &mut Session) -> HandlerOutcome {
        let calls = session.get_or_insert_with(|| 0u32);
        *calls += 1;
        debug!(job_id = %job.id, calls = *calls, "echoing job payload");
        HandlerOutcome::Ok(job.payload.clone())
    }
}
