//! External task source adapter.
//!
//! The coordinator can mirror work from an external system into the local
//! queue and report terminal results back. It depends only on the narrow
//! [`TaskSource`] trait, never on a specific transport; [`HttpTaskSource`]
//! is the polling implementation shipped here.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::scheduler::NewTask;
use crate::storage::{StoreError, TaskStore};

/// Errors talking to an external task source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Transport-level failure (connection, timeout, bad status).
    #[error("source transport failed: {0}")]
    Transport(String),

    /// The source returned a body that does not match the contract.
    #[error("source returned malformed payload: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        SourceError::Transport(e.to_string())
    }
}

/// A unit of work offered by an external source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceTask {
    /// Source-side identifier; doubles as the idempotency key so repeated
    /// polls of the same task enqueue it once.
    pub source_id: String,
    /// Task type to route on.
    pub task_type: String,
    /// Opaque payload.
    pub params: serde_json::Value,
    /// Optional priority override.
    #[serde(default)]
    pub priority: Option<i32>,
    /// Optional retry budget override.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Earliest time the task may run.
    #[serde(default)]
    pub run_after: Option<DateTime<Utc>>,
}

/// Narrow interface to an external task system. Implementable over HTTP
/// polling, a message-queue client, or a direct database connection.
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// Fetches the next available task, or `None` when the source is empty.
    async fn receive_task(&self) -> Result<Option<SourceTask>, SourceError>;

    /// Reports a terminal result for a previously received task.
    async fn complete_task(
        &self,
        source_id: &str,
        result: &serde_json::Value,
    ) -> Result<(), SourceError>;

    /// Whether the source is reachable and willing to serve.
    async fn health_check(&self) -> bool;
}

/// HTTP-polling task source.
///
/// Endpoints: `GET /tasks/next` (200 with a [`SourceTask`] body, 204 when
/// empty), `POST /tasks/{id}/complete`, `GET /health`.
pub struct HttpTaskSource {
    base_url: String,
    client: reqwest::Client,
}

impl HttpTaskSource {
    /// Creates a source polling the given base URL.
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Ok(Self { base_url, client })
    }
}

#[async_trait]
impl TaskSource for HttpTaskSource {
    async fn receive_task(&self) -> Result<Option<SourceTask>, SourceError> {
        let response = self
            .client
            .get(format!("{}/tasks/next", self.base_url))
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(SourceError::Transport(format!(
                "GET /tasks/next returned {}",
                response.status()
            )));
        }

        let task: SourceTask = response
            .json()
            .await
            .map_err(|e| SourceError::Malformed(e.to_string()))?;
        Ok(Some(task))
    }

    async fn complete_task(
        &self,
        source_id: &str,
        result: &serde_json::Value,
    ) -> Result<(), SourceError> {
        let response = self
            .client
            .post(format!("{}/tasks/{}/complete", self.base_url, source_id))
            .json(result)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SourceError::Transport(format!(
                "POST /tasks/{source_id}/complete returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn health_check(&self) -> bool {
        self.client
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

/// Pulls tasks from a source into the local queue and pushes terminal
/// results back.
pub struct SourceIngest {
    store: TaskStore,
    source: Arc<dyn TaskSource>,
    poll_interval: Duration,
    shutdown_rx: broadcast::Receiver<()>,
}

impl SourceIngest {
    /// Creates an ingest loop over a source.
    pub fn new(
        store: TaskStore,
        source: Arc<dyn TaskSource>,
        poll_interval: Duration,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            store,
            source,
            poll_interval,
            shutdown_rx,
        }
    }

    /// Runs until shutdown. One iteration drains the source, then
    /// acknowledges any unreported terminal tasks.
    pub async fn run(mut self) {
        info!("source ingest started");

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => break,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            if !self.source.health_check().await {
                warn!("task source unhealthy, skipping poll");
                tokio::time::sleep(self.poll_interval).await;
                continue;
            }

            if let Err(e) = self.pull_available().await {
                warn!(error = %e, "source pull failed");
            }
            if let Err(e) = self.ack_terminal().await {
                warn!(error = %e, "source ack failed");
            }

            tokio::time::sleep(self.poll_interval).await;
        }

        info!("source ingest stopped");
    }

    /// Drains the source until it reports empty.
    async fn pull_available(&self) -> Result<(), IngestError> {
        while let Some(task) = self.source.receive_task().await? {
            let mut new_task = NewTask::new(&task.task_type, task.params.clone())
                .with_idempotency_key(&task.source_id);
            if let Some(priority) = task.priority {
                new_task = new_task.with_priority(priority);
            }
            if let Some(max_attempts) = task.max_attempts {
                new_task = new_task.with_max_attempts(max_attempts);
            }
            if let Some(run_after) = task.run_after {
                new_task = new_task.with_run_after(run_after);
            }

            let enqueued = self.store.enqueue(new_task).await?;
            if enqueued.deduplicated {
                debug!(source_id = %task.source_id, "source task already enqueued");
            } else {
                debug!(
                    source_id = %task.source_id,
                    task_id = enqueued.id,
                    task_type = %task.task_type,
                    "source task enqueued"
                );
            }
        }
        Ok(())
    }

    /// Reports terminal results the source has not seen yet.
    ///
    /// A rejected ack is logged and skipped rather than aborting the pass:
    /// the batch is ordered by id, so one id the source refuses (a 404, or
    /// an idempotency key that was never a source id) must not starve the
    /// tasks behind it. The skipped task stays unacked and is retried next
    /// cycle.
    async fn ack_terminal(&self) -> Result<(), IngestError> {
        let pending = self.store.unacked_terminal(50).await?;
        for task in pending {
            let Some(source_id) = task.idempotency_key.as_deref() else {
                continue;
            };

            let report = json!({
                "status": task.status.as_str(),
                "result": task.result,
                "error": task.last_error,
                "attempts": task.attempts,
            });
            if let Err(e) = self.source.complete_task(source_id, &report).await {
                warn!(
                    task_id = task.id,
                    source_id,
                    error = %e,
                    "source rejected terminal result"
                );
                continue;
            }
            self.store.mark_source_acked(task.id).await?;

            debug!(
                task_id = task.id,
                source_id,
                status = %task.status,
                "terminal result reported to source"
            );
        }
        Ok(())
    }
}

/// Errors inside one ingest iteration. Logged and retried next cycle.
#[derive(Debug, Error)]
enum IngestError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
