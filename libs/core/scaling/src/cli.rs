//! Shared CLI shell-out helper for the backends in this module (§4.E):
//! none of this codebase's dependencies embed a container daemon, cluster,
//! or cloud-fleet API client, so every backend drives its control tool's
//! command-line interface instead, via `tokio::process::Command`.

use tokio::process::Command;
use tracing::debug;

use crate::backend::ScalingError;

/// Runs `program args...` to completion and returns trimmed stdout on
/// success. A missing binary or a non-zero exit both produce a
/// [`ScalingError::Retryable`] — transient from the scaling service's point
/// of view, since the next tick simply tries again — except when stderr
/// indicates the target resource does not exist at all, which is permanent.
pub async fn run(program: &str, args: &[&str]) -> Result<String, ScalingError> {
    debug!(program, ?args, "running scaling backend command");
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| ScalingError::Retryable(format!("failed to spawn {program}: {e}")))?;

    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.to_lowercase().contains("not found") {
        Err(ScalingError::Permanent(format!("{program} {args:?}: {stderr}")))
    } else {
        Err(ScalingError::Retryable(format!("{program} {args:?}: {stderr}")))
    }
}
