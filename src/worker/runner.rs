//! Worker subprocess execution.
//!
//! Spawns the configured executable for one task, feeds it the protocol
//! request on stdin, enforces the wall-clock timeout and classifies the
//! finished process into a [`WorkOutcome`].

use std::process::Stdio;
use std::time::Instant;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::scheduler::FailureKind;
use crate::worker::config::WorkerConfig;
use crate::worker::protocol::{WorkOutcome, WorkRequest};

/// Errors spawning or talking to the subprocess. Protocol-level problems
/// (bad output, nonzero exit) are outcomes, not errors.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The executable could not be started.
    #[error("failed to spawn worker '{command}': {source}")]
    Spawn {
        /// Executable that failed to start.
        command: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The request could not be serialized.
    #[error("failed to encode work request: {0}")]
    Encode(#[from] serde_json::Error),

    /// IO on the child's streams failed.
    #[error("worker io failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Runs one task through the configured worker subprocess.
///
/// A timeout kills the child (via `kill_on_drop`) and yields a retryable
/// timeout failure rather than an error: the task goes back through the
/// retry handler like any other failed attempt.
pub async fn run_worker(
    config: &WorkerConfig,
    request: &WorkRequest,
) -> Result<WorkOutcome, RunnerError> {
    let start = Instant::now();
    let payload = serde_json::to_vec(request)?;

    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in &config.env {
        cmd.env(key, value);
    }
    if let Some(dir) = &config.working_dir {
        cmd.current_dir(dir);
    }

    debug!(
        task_id = request.id,
        worker = %config.name,
        command = %config.command,
        "spawning worker"
    );

    let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
        command: config.command.clone(),
        source,
    })?;

    // The stdin write is part of the timed exchange: a worker that never
    // reads its stdin would otherwise block the write forever once the
    // request outgrows the pipe buffer.
    let stdin = child.stdin.take();
    let exchange = async move {
        if let Some(mut stdin) = stdin {
            stdin.write_all(&payload).await?;
            stdin.write_all(b"\n").await?;
            stdin.shutdown().await.ok();
        }
        child.wait_with_output().await
    };

    let output = match tokio::time::timeout(config.timeout(), exchange).await {
        Ok(output) => output?,
        Err(_) => {
            // The child was moved into the dropped future; kill_on_drop
            // reaps it.
            warn!(
                task_id = request.id,
                worker = %config.name,
                timeout_seconds = config.timeout_seconds,
                "worker timed out"
            );
            return Ok(WorkOutcome::Failure {
                kind: FailureKind::Retryable,
                error_type: "timeout".to_string(),
                message: format!(
                    "worker '{}' exceeded {}s timeout",
                    config.name, config.timeout_seconds
                ),
            });
        }
    };

    let exit_code = output.status.code();
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    if !stderr.trim().is_empty() {
        debug!(
            task_id = request.id,
            worker = %config.name,
            stderr = %stderr.trim(),
            "worker stderr"
        );
    }

    let outcome = WorkOutcome::classify(exit_code, &stdout);
    debug!(
        task_id = request.id,
        worker = %config.name,
        exit_code = exit_code.unwrap_or(-1),
        success = outcome.is_success(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "worker finished"
    );
    Ok(outcome)
}
