//! Worker host coordinator.
//!
//! One `WorkerHost` runs per machine. It claims tasks from the store,
//! routes each to the worker executable registered for its type, supervises
//! the subprocess, and reports the outcome back through the retry handler.
//! It contains no task-specific logic: adding a worker is a configuration
//! change, not a code change.
//!
//! # Lifecycle
//!
//! `start` registers the host in the worker registry table, spawns the
//! claim loops and a host heartbeat, and returns. Each claim loop pulls one
//! task at a time; while a subprocess runs, a per-task heartbeat keeps the
//! lease alive. `shutdown` broadcasts a stop signal, waits for in-flight
//! tasks up to a timeout, and deregisters the host.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::scheduler::{FailureKind, RetryPolicy, SchedulingStrategy, Task};
use crate::storage::{ClaimRequest, StoreError, TaskStore};
use crate::worker::{run_worker, RunnerError, WorkOutcome, WorkRequest, WorkerRegistry};

/// Errors from host lifecycle operations.
#[derive(Debug, Error)]
pub enum HostError {
    /// The host is already running.
    #[error("host is already running")]
    AlreadyRunning,

    /// The host is not running.
    #[error("host is not running")]
    NotRunning,

    /// Store access failed during startup or shutdown.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// In-flight tasks did not finish before the shutdown deadline.
    #[error("shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for a worker host.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Identity recorded on leases and in the worker registry. Defaults to
    /// a fresh UUID per process.
    pub host_id: String,
    /// Number of concurrent claim loops.
    pub concurrency: usize,
    /// Ordering policy for claims.
    pub strategy: SchedulingStrategy,
    /// Lease granted per claim; renewed by the per-task heartbeat.
    pub lease_duration: Duration,
    /// Interval between lease renewals and host heartbeats.
    pub heartbeat_interval: Duration,
    /// Initial idle sleep when no work is available; doubles up to
    /// `max_idle_backoff`.
    pub poll_interval: Duration,
    /// Idle sleep ceiling.
    pub max_idle_backoff: Duration,
    /// How long shutdown waits for in-flight tasks.
    pub shutdown_timeout: Duration,
    /// Capability tag recorded in the worker registry.
    pub region: Option<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host_id: format!("host-{}", Uuid::new_v4()),
            concurrency: 4,
            strategy: SchedulingStrategy::default(),
            lease_duration: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(15),
            poll_interval: Duration::from_millis(250),
            max_idle_backoff: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(60),
            region: None,
        }
    }
}

impl HostConfig {
    /// Creates a config with the given concurrency.
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Default::default()
        }
    }

    /// Sets the host identity.
    pub fn with_host_id(mut self, host_id: impl Into<String>) -> Self {
        self.host_id = host_id.into();
        self
    }

    /// Sets the scheduling strategy.
    pub fn with_strategy(mut self, strategy: SchedulingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the lease duration.
    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    /// Sets the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the idle poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Point-in-time host statistics.
#[derive(Debug, Clone, Default)]
pub struct HostStats {
    /// Number of claim loops.
    pub concurrency: usize,
    /// Tasks currently being processed.
    pub active_tasks: usize,
    /// Tasks that succeeded since startup.
    pub tasks_succeeded: u64,
    /// Failed attempts (retried or dead-lettered) since startup.
    pub tasks_failed: u64,
    /// Average subprocess wall time.
    pub average_task_duration: Duration,
}

impl HostStats {
    /// Total attempts processed.
    pub fn total_processed(&self) -> u64 {
        self.tasks_succeeded + self.tasks_failed
    }
}

/// Shared counters behind the stats snapshot.
struct SharedHostStats {
    tasks_succeeded: AtomicU64,
    tasks_failed: AtomicU64,
    total_duration_ms: AtomicU64,
    active_tasks: AtomicU64,
}

impl SharedHostStats {
    fn new() -> Self {
        Self {
            tasks_succeeded: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_tasks: AtomicU64::new(0),
        }
    }

    fn record_success(&self, duration: Duration) {
        self.tasks_succeeded.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_failure(&self, duration: Duration) {
        self.tasks_failed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn to_stats(&self, concurrency: usize) -> HostStats {
        let succeeded = self.tasks_succeeded.load(Ordering::SeqCst);
        let failed = self.tasks_failed.load(Ordering::SeqCst);
        let total = succeeded + failed;
        let average = if total > 0 {
            Duration::from_millis(self.total_duration_ms.load(Ordering::SeqCst) / total)
        } else {
            Duration::ZERO
        };

        HostStats {
            concurrency,
            active_tasks: self.active_tasks.load(Ordering::SeqCst) as usize,
            tasks_succeeded: succeeded,
            tasks_failed: failed,
            average_task_duration: average,
        }
    }
}

/// Coordinates claim loops and worker subprocesses over one store.
pub struct WorkerHost {
    config: HostConfig,
    store: TaskStore,
    registry: Arc<WorkerRegistry>,
    retry_policy: RetryPolicy,
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedHostStats>,
    is_running: AtomicBool,
}

impl WorkerHost {
    /// Creates a host over a store and a worker registry.
    pub fn new(
        config: HostConfig,
        store: TaskStore,
        registry: WorkerRegistry,
        retry_policy: RetryPolicy,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            store,
            registry: Arc::new(registry),
            retry_policy,
            shutdown_tx,
            handles: Vec::new(),
            stats: Arc::new(SharedHostStats::new()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Registers the host and spawns its claim loops and heartbeat.
    pub async fn start(&mut self) -> Result<(), HostError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(HostError::AlreadyRunning);
        }

        let task_types = self.registry.task_types();
        self.store
            .register_worker(
                &self.config.host_id,
                &task_types,
                self.config.region.as_deref(),
            )
            .await?;

        // Per-worker concurrency bounds, shared across all claim loops.
        let limits: HashMap<String, Arc<Semaphore>> = task_types
            .iter()
            .filter_map(|task_type| self.registry.worker_for(task_type).cloned())
            .map(|config| {
                (
                    config.name.clone(),
                    Arc::new(Semaphore::new(config.max_concurrency)),
                )
            })
            .collect();
        let limits = Arc::new(limits);

        for i in 0..self.config.concurrency {
            let claimer = Claimer {
                id: format!("{}/claim-{}", self.config.host_id, i),
                config: self.config.clone(),
                store: self.store.clone(),
                registry: Arc::clone(&self.registry),
                retry_policy: self.retry_policy.clone(),
                limits: Arc::clone(&limits),
                stats: Arc::clone(&self.stats),
                shutdown_rx: self.shutdown_tx.subscribe(),
            };
            self.handles.push(tokio::spawn(claimer.run()));
        }

        self.handles.push(tokio::spawn(host_heartbeat(
            self.store.clone(),
            self.config.host_id.clone(),
            self.config.heartbeat_interval,
            self.shutdown_tx.subscribe(),
        )));

        self.is_running.store(true, Ordering::SeqCst);
        info!(
            host_id = %self.config.host_id,
            concurrency = self.config.concurrency,
            strategy = self.config.strategy.name(),
            "worker host started"
        );
        Ok(())
    }

    /// Signals all loops to stop and waits for in-flight tasks.
    pub async fn shutdown(&mut self) -> Result<(), HostError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(HostError::NotRunning);
        }

        info!(host_id = %self.config.host_id, "worker host shutting down");
        let _ = self.shutdown_tx.send(());

        let drain = async {
            for handle in self.handles.drain(..) {
                if let Err(e) = handle.await {
                    error!(error = %e, "host task panicked during shutdown");
                }
            }
        };

        let result = match tokio::time::timeout(self.config.shutdown_timeout, drain).await {
            Ok(()) => Ok(()),
            Err(_) => Err(HostError::ShutdownTimeout(self.config.shutdown_timeout)),
        };
        self.is_running.store(false, Ordering::SeqCst);

        // Deregister even on timeout; leases recover via expiry.
        self.store.remove_worker(&self.config.host_id).await?;
        info!(host_id = %self.config.host_id, "worker host stopped");
        result
    }

    /// Current statistics.
    pub fn stats(&self) -> HostStats {
        self.stats.to_stats(self.config.concurrency)
    }

    /// Whether the host is running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Subscribe to the host's shutdown signal, for companion loops like
    /// source ingest.
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }
}

/// One claim loop: claim, dispatch, report, repeat.
struct Claimer {
    id: String,
    config: HostConfig,
    store: TaskStore,
    registry: Arc<WorkerRegistry>,
    retry_policy: RetryPolicy,
    limits: Arc<HashMap<String, Arc<Semaphore>>>,
    stats: Arc<SharedHostStats>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl Claimer {
    async fn run(mut self) {
        debug!(claimer = %self.id, "claim loop started");
        let mut idle_backoff = self.config.poll_interval;

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => break,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            // Only claim types whose worker still has concurrency headroom.
            let eligible: Vec<String> = self
                .registry
                .task_types()
                .into_iter()
                .filter(|task_type| {
                    self.registry
                        .worker_for(task_type)
                        .and_then(|w| self.limits.get(&w.name))
                        .is_some_and(|sem| sem.available_permits() > 0)
                })
                .collect();

            if eligible.is_empty() {
                tokio::time::sleep(idle_backoff).await;
                continue;
            }

            let request = ClaimRequest {
                worker_id: &self.config.host_id,
                strategy: self.config.strategy,
                lease: self.config.lease_duration,
                task_types: Some(&eligible),
            };

            match self.store.claim(&request).await {
                Ok(Some(task)) => {
                    idle_backoff = self.config.poll_interval;
                    self.process(task).await;
                }
                Ok(None) => {
                    tokio::time::sleep(idle_backoff).await;
                    idle_backoff =
                        (idle_backoff.saturating_mul(2)).min(self.config.max_idle_backoff);
                }
                Err(e) => {
                    error!(claimer = %self.id, error = %e, "claim failed");
                    tokio::time::sleep(idle_backoff).await;
                    idle_backoff =
                        (idle_backoff.saturating_mul(2)).min(self.config.max_idle_backoff);
                }
            }
        }

        debug!(claimer = %self.id, "claim loop stopped");
    }

    /// Runs one claimed task through its worker and reports the outcome.
    async fn process(&self, task: Task) {
        let start = Instant::now();
        self.stats.active_tasks.fetch_add(1, Ordering::SeqCst);

        // Keep the lease alive while the subprocess runs.
        let heartbeat = tokio::spawn(lease_heartbeat(
            self.store.clone(),
            task.id,
            self.config.host_id.clone(),
            self.config.lease_duration,
            self.config.heartbeat_interval,
        ));

        let outcome = self.dispatch(&task).await;

        heartbeat.abort();
        self.stats.active_tasks.fetch_sub(1, Ordering::SeqCst);
        let duration = start.elapsed();

        let report = match outcome {
            WorkOutcome::Success(result) => {
                self.stats.record_success(duration);
                self.store
                    .complete(task.id, &self.config.host_id, result)
                    .await
                    .map(|_| ())
            }
            WorkOutcome::Failure {
                kind,
                error_type,
                message,
            } => {
                self.stats.record_failure(duration);
                self.store
                    .fail(
                        task.id,
                        &self.config.host_id,
                        kind,
                        &format!("{error_type}: {message}"),
                        &self.retry_policy,
                    )
                    .await
                    .map(|_| ())
            }
        };

        if let Err(e) = report {
            // Usually a lost lease after an expiry; the task is already
            // someone else's problem.
            warn!(
                claimer = %self.id,
                task_id = task.id,
                error = %e,
                "failed to report task outcome"
            );
        }
    }

    /// Routes the task to its worker subprocess and classifies the result.
    async fn dispatch(&self, task: &Task) -> WorkOutcome {
        let Some(worker) = self.registry.worker_for(&task.task_type) else {
            return WorkOutcome::Failure {
                kind: FailureKind::Permanent,
                error_type: "no-worker".to_string(),
                message: format!("no worker configured for task type '{}'", task.task_type),
            };
        };

        let permit = match self.limits.get(&worker.name) {
            Some(sem) => sem.clone().acquire_owned().await,
            None => {
                return WorkOutcome::Failure {
                    kind: FailureKind::Permanent,
                    error_type: "no-worker".to_string(),
                    message: format!("worker '{}' has no concurrency limit entry", worker.name),
                }
            }
        };
        let _permit = match permit {
            Ok(permit) => permit,
            Err(_) => {
                return WorkOutcome::Failure {
                    kind: FailureKind::Retryable,
                    error_type: "shutdown".to_string(),
                    message: "worker semaphore closed".to_string(),
                }
            }
        };

        let request = WorkRequest::for_task(task);
        match run_worker(worker, &request).await {
            Ok(outcome) => outcome,
            Err(RunnerError::Spawn { command, source }) => WorkOutcome::Failure {
                kind: FailureKind::Permanent,
                error_type: "worker-spawn-failed".to_string(),
                message: format!("cannot start '{command}': {source}"),
            },
            Err(e) => WorkOutcome::Failure {
                kind: FailureKind::Retryable,
                error_type: "worker-io".to_string(),
                message: e.to_string(),
            },
        }
    }
}

/// Renews the lease on one task until aborted.
async fn lease_heartbeat(
    store: TaskStore,
    task_id: i64,
    host_id: String,
    lease: Duration,
    interval: Duration,
) {
    loop {
        tokio::time::sleep(interval).await;
        match store.extend_lease(task_id, &host_id, lease).await {
            Ok(()) => debug!(task_id, "lease renewed"),
            Err(e) => {
                // The lease is gone; stop renewing and let the outcome
                // report discover it.
                warn!(task_id, error = %e, "lease renewal failed");
                break;
            }
        }
    }
}

/// Updates the host's registry row until shutdown.
async fn host_heartbeat(
    store: TaskStore,
    host_id: String,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = tokio::time::sleep(interval) => {
                if let Err(e) = store.worker_heartbeat(&host_id).await {
                    warn!(host_id = %host_id, error = %e, "host heartbeat failed");
                }
            }
        }
    }
}
