//! SQLite-backed task store.
//!
//! `TaskStore` is the sole mutator of task, worker and log rows. It owns a
//! sqlx connection pool opened in WAL mode so readers are never blocked by
//! writers, with a configurable busy timeout for lock contention. All
//! statements are parameterized; the only interpolated fragments are the
//! ORDER BY clauses supplied by [`SchedulingStrategy`], which are static
//! strings.
//!
//! # Claim protocol
//!
//! A claim is a candidate select followed by a guarded single-statement
//! `UPDATE ... RETURNING` that re-checks eligibility by id. SQLite
//! serializes writers, so the guard makes at-most-one-claimant hold under
//! any number of concurrent claim attempts: losers affect zero rows and move
//! on to the next candidate. Expired leases satisfy the same eligibility
//! predicate, which is how abandoned work is reclaimed (lazily, by the next
//! claim that reaches it).

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::scheduler::{
    ClaimCandidate, FailureKind, NewTask, RetryPolicy, SchedulingStrategy, Task, TaskEvent,
    TaskLogEntry, TaskStatus, WorkerInfo,
};
use crate::storage::schema;

/// Eligibility predicate shared by the candidate select and the lease guard.
/// Binds the current time twice (milliseconds).
const ELIGIBLE: &str = "((status = 'queued' AND run_after_utc <= ?) \
                         OR (status = 'leased' AND lease_until_utc <= ?))";

/// How many select-then-lease rounds a claim runs before reporting no work.
/// A round only repeats when every fetched candidate was leased by a
/// concurrent claimant between the select and the guarded update.
const CLAIM_ROUNDS: u32 = 3;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Opening the database failed.
    #[error("failed to open task store: {0}")]
    OpenFailed(String),

    /// Query execution failed.
    #[error("query failed: {0}")]
    Query(#[from] sqlx::Error),

    /// Payload serialization failed.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No task with the given id.
    #[error("task {0} not found")]
    TaskNotFound(i64),

    /// The caller does not hold the lease on the task.
    #[error("task {task_id} is not leased by worker {worker_id}")]
    LeaseNotHeld {
        /// Task in question.
        task_id: i64,
        /// Worker that claimed to hold the lease.
        worker_id: String,
    },

    /// The task is not in a status the operation accepts.
    #[error("task {task_id} is {status}, cannot {operation}")]
    InvalidTransition {
        /// Task in question.
        task_id: i64,
        /// Its current status.
        status: TaskStatus,
        /// The rejected operation.
        operation: &'static str,
    },

    /// The worker is not registered.
    #[error("worker {0} is not registered")]
    WorkerNotRegistered(String),

    /// A stored value could not be decoded. Indicates corruption or an
    /// incompatible schema; fatal to the caller.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Tuning knobs for the store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// SQLite busy timeout for lock contention.
    pub busy_timeout: Duration,
    /// Connection pool size.
    pub max_connections: u32,
    /// How many times a claim blocked on SQLITE_BUSY is retried internally.
    pub claim_retries: u32,
    /// Initial backoff between claim retries; doubles each time.
    pub claim_backoff: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(5),
            max_connections: 4,
            claim_retries: 5,
            claim_backoff: Duration::from_millis(20),
        }
    }
}

impl StoreConfig {
    /// Sets the busy timeout.
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Sets the pool size.
    pub fn with_max_connections(mut self, connections: u32) -> Self {
        self.max_connections = connections;
        self
    }
}

/// Outcome of an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enqueued {
    /// Row id of the stored task.
    pub id: i64,
    /// True when an existing task with the same idempotency key was found
    /// and no new row was inserted.
    pub deduplicated: bool,
}

/// Parameters for a claim attempt.
#[derive(Debug, Clone)]
pub struct ClaimRequest<'a> {
    /// Identity recorded in `locked_by`.
    pub worker_id: &'a str,
    /// Ordering policy for candidate selection.
    pub strategy: SchedulingStrategy,
    /// Lease duration granted on success.
    pub lease: Duration,
    /// Restrict to these task types; `None` claims any type.
    pub task_types: Option<&'a [String]>,
}

/// What `fail` decided to do with the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Requeued; claimable again at the contained instant.
    Retried {
        /// When the task becomes eligible again.
        run_after: DateTime<Utc>,
    },
    /// Moved to the dead-letter state.
    DeadLettered,
}

/// Per-status task counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Tasks waiting to be claimed.
    pub queued: u64,
    /// Tasks under a live (or expired, not yet reclaimed) lease.
    pub leased: u64,
    /// Successfully completed tasks.
    pub succeeded: u64,
    /// Failed or cancelled tasks.
    pub failed: u64,
    /// Dead-lettered tasks.
    pub dead: u64,
}

impl QueueStats {
    /// Total number of tasks across all states.
    pub fn total(&self) -> u64 {
        self.queued + self.leased + self.succeeded + self.failed + self.dead
    }
}

/// SQLite-backed task store. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct TaskStore {
    pool: SqlitePool,
    config: StoreConfig,
}

impl TaskStore {
    /// Opens (creating if missing) the store at `path` and applies the
    /// schema. The database is put in WAL mode with NORMAL synchronous
    /// writes; this is safe for multiple coordinator processes on local
    /// disk, and explicitly unsupported on network filesystems.
    pub async fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(config.busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(opts)
            .await
            .map_err(|e| StoreError::OpenFailed(e.to_string()))?;

        for statement in schema::all_schema_statements() {
            sqlx::query(statement).execute(&pool).await?;
        }

        info!(path = %path.as_ref().display(), "task store opened");
        Ok(Self { pool, config })
    }

    /// Returns a reference to the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // =========================================================================
    // Enqueue
    // =========================================================================

    /// Stores a new task in `queued` state.
    ///
    /// When the task carries an idempotency key that already exists, no row
    /// is inserted and the existing task's id is returned with
    /// `deduplicated = true`.
    pub async fn enqueue(&self, task: NewTask) -> Result<Enqueued, StoreError> {
        let now = Utc::now();
        let run_after = task.run_after.unwrap_or(now);
        let params = serde_json::to_string(&task.params)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO task_queue (
                task_type, params, status, priority, max_attempts,
                run_after_utc, idempotency_key, created_at_utc
            ) VALUES (?, ?, 'queued', ?, ?, ?, ?, ?)
            ON CONFLICT(idempotency_key) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&task.task_type)
        .bind(&params)
        .bind(task.priority)
        .bind(i64::from(task.max_attempts))
        .bind(to_millis(run_after))
        .bind(&task.idempotency_key)
        .bind(to_millis(now))
        .fetch_all(&self.pool)
        .await?;

        if let Some(row) = inserted.first() {
            let id: i64 = row.get(0);
            debug!(task_id = id, task_type = %task.task_type, "task enqueued");
            return Ok(Enqueued {
                id,
                deduplicated: false,
            });
        }

        // The insert was suppressed by the idempotency key conflict.
        let key = task.idempotency_key.as_deref().ok_or_else(|| {
            StoreError::Corrupt("insert without idempotency key returned no row".to_string())
        })?;
        let id: i64 = sqlx::query("SELECT id FROM task_queue WHERE idempotency_key = ?")
            .bind(key)
            .fetch_one(&self.pool)
            .await?
            .get(0);

        debug!(task_id = id, key = key, "duplicate enqueue deduplicated");
        Ok(Enqueued {
            id,
            deduplicated: true,
        })
    }

    // =========================================================================
    // Claim protocol
    // =========================================================================

    /// Attempts to claim one task.
    ///
    /// Returns `Ok(None)` when no eligible work exists. `SQLITE_BUSY`
    /// contention is retried internally with bounded exponential backoff and
    /// never surfaced as a task failure.
    pub async fn claim(&self, req: &ClaimRequest<'_>) -> Result<Option<Task>, StoreError> {
        let mut delay = self.config.claim_backoff;
        let mut attempt = 0u32;

        loop {
            match self.try_claim(req).await {
                Err(StoreError::Query(e)) if is_busy(&e) && attempt < self.config.claim_retries => {
                    attempt += 1;
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "claim hit busy database, retrying");
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                other => return other,
            }
        }
    }

    async fn try_claim(&self, req: &ClaimRequest<'_>) -> Result<Option<Task>, StoreError> {
        let limit = req.strategy.candidate_limit();

        for _ in 0..CLAIM_ROUNDS {
            let now = Utc::now();
            let candidates = self.claim_candidates(req, now, limit).await?;
            if candidates.is_empty() {
                return Ok(None);
            }

            // The strategy picks the preferred candidate; losing the race for
            // it falls through to the remaining candidates in select order.
            let picks: Vec<ClaimCandidate> = candidates.iter().map(|c| c.0).collect();
            let preferred = match req.strategy.pick(&picks) {
                Some(idx) => idx,
                None => return Ok(None),
            };
            let mut order: Vec<usize> = Vec::with_capacity(candidates.len());
            order.push(preferred);
            order.extend((0..candidates.len()).filter(|&i| i != preferred));

            for idx in order {
                let (candidate, reclaimed) = candidates[idx];
                if let Some(task) = self.lease_candidate(candidate.id, req, now, reclaimed).await? {
                    return Ok(Some(task));
                }
            }
            // Every candidate was taken by a concurrent claimant; re-select.
        }

        Ok(None)
    }

    /// Fetches up to `limit` eligible candidate rows in strategy order.
    /// The second tuple element is true for expired-lease reclaims.
    async fn claim_candidates(
        &self,
        req: &ClaimRequest<'_>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<(ClaimCandidate, bool)>, StoreError> {
        let now_ms = to_millis(now);
        let type_filter = match req.task_types {
            Some(types) if !types.is_empty() => {
                let placeholders = vec!["?"; types.len()].join(", ");
                format!("AND task_type IN ({placeholders})")
            }
            Some(_) => return Ok(Vec::new()),
            None => String::new(),
        };

        let sql = format!(
            "SELECT id, priority, status FROM task_queue \
             WHERE {ELIGIBLE} {type_filter} \
             ORDER BY {order} LIMIT ?",
            order = req.strategy.order_clause(),
        );

        let mut query = sqlx::query(&sql).bind(now_ms).bind(now_ms);
        if let Some(types) = req.task_types {
            for task_type in types {
                query = query.bind(task_type);
            }
        }
        let rows = query.bind(limit as i64).fetch_all(&self.pool).await?;

        Ok(rows
            .iter()
            .map(|row| {
                let status: String = row.get("status");
                (
                    ClaimCandidate {
                        id: row.get("id"),
                        priority: row.get("priority"),
                    },
                    status == TaskStatus::Leased.as_str(),
                )
            })
            .collect())
    }

    /// Leases one candidate with a guarded single-statement update.
    ///
    /// Returns `None` when a concurrent claimant won the row first.
    async fn lease_candidate(
        &self,
        task_id: i64,
        req: &ClaimRequest<'_>,
        now: DateTime<Utc>,
        reclaimed: bool,
    ) -> Result<Option<Task>, StoreError> {
        let now_ms = to_millis(now);
        let lease_until = now
            + chrono::Duration::from_std(req.lease)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));

        let sql = format!(
            "UPDATE task_queue \
             SET status = 'leased', lease_until_utc = ?, locked_by = ? \
             WHERE id = ? AND {ELIGIBLE} \
             RETURNING *",
        );

        // The lease and its audit entry commit together, like the other
        // state transitions.
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&sql)
            .bind(to_millis(lease_until))
            .bind(req.worker_id)
            .bind(task_id)
            .bind(now_ms)
            .bind(now_ms)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let task = task_from_row(&row)?;

        let detail = if reclaimed {
            format!("worker={} (expired lease reclaimed)", req.worker_id)
        } else {
            format!("worker={}", req.worker_id)
        };
        self.append_log(&mut *tx, task.id, TaskEvent::Claimed, Some(&detail))
            .await?;
        tx.commit().await?;

        debug!(
            task_id = task.id,
            worker_id = req.worker_id,
            task_type = %task.task_type,
            reclaimed,
            "task claimed"
        );
        Ok(Some(task))
    }

    // =========================================================================
    // Lease lifecycle
    // =========================================================================

    /// Extends the lease on a task. The heartbeat call for long-running work.
    pub async fn extend_lease(
        &self,
        task_id: i64,
        worker_id: &str,
        lease: Duration,
    ) -> Result<(), StoreError> {
        let lease_until = Utc::now()
            + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::seconds(60));

        let result = sqlx::query(
            "UPDATE task_queue SET lease_until_utc = ? \
             WHERE id = ? AND status = 'leased' AND locked_by = ?",
        )
        .bind(to_millis(lease_until))
        .bind(task_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::LeaseNotHeld {
                task_id,
                worker_id: worker_id.to_string(),
            });
        }
        Ok(())
    }

    /// Marks a leased task as succeeded and records its result.
    pub async fn complete(
        &self,
        task_id: i64,
        worker_id: &str,
        result: serde_json::Value,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let result_json = serde_json::to_string(&result)?;

        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE task_queue \
             SET status = 'succeeded', result = ?, finished_at_utc = ?, \
                 lease_until_utc = NULL, locked_by = NULL \
             WHERE id = ? AND status = 'leased' AND locked_by = ?",
        )
        .bind(&result_json)
        .bind(to_millis(now))
        .bind(task_id)
        .bind(worker_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(self.lease_failure(task_id, worker_id).await);
        }

        self.append_log(&mut *tx, task_id, TaskEvent::Succeeded, Some(&format!("worker={worker_id}")))
            .await?;
        tx.commit().await?;

        debug!(task_id, worker_id, "task succeeded");
        Ok(())
    }

    /// Records a failed attempt and decides between retry and dead-letter.
    ///
    /// The attempt counter always increments, but only retryable failures
    /// spend retry budget: a permanent failure dead-letters immediately no
    /// matter how many attempts remain. The failure is logged before the
    /// state transition commits.
    pub async fn fail(
        &self,
        task_id: i64,
        worker_id: &str,
        kind: FailureKind,
        detail: &str,
        policy: &RetryPolicy,
    ) -> Result<FailureDisposition, StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "UPDATE task_queue SET attempts = attempts + 1 \
             WHERE id = ? AND status = 'leased' AND locked_by = ? \
             RETURNING attempts, max_attempts",
        )
        .bind(task_id)
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Err(self.lease_failure(task_id, worker_id).await);
        };
        let attempts: i64 = row.get("attempts");
        let max_attempts: i64 = row.get("max_attempts");

        self.append_log(
            &mut *tx,
            task_id,
            TaskEvent::Failed,
            Some(&format!("{kind}: {detail}")),
        )
        .await?;

        let disposition = if kind == FailureKind::Retryable && attempts < max_attempts {
            let backoff = policy.delay_with_jitter(attempts as u32);
            let run_after = now
                + chrono::Duration::from_std(backoff)
                    .unwrap_or_else(|_| chrono::Duration::seconds(60));

            sqlx::query(
                "UPDATE task_queue \
                 SET status = 'queued', run_after_utc = ?, last_error = ?, \
                     lease_until_utc = NULL, locked_by = NULL \
                 WHERE id = ?",
            )
            .bind(to_millis(run_after))
            .bind(detail)
            .bind(task_id)
            .execute(&mut *tx)
            .await?;

            self.append_log(
                &mut *tx,
                task_id,
                TaskEvent::Retried,
                Some(&format!(
                    "attempt {attempts}/{max_attempts}, backoff {}ms",
                    backoff.as_millis()
                )),
            )
            .await?;

            FailureDisposition::Retried { run_after }
        } else {
            sqlx::query(
                "UPDATE task_queue \
                 SET status = 'dead', finished_at_utc = ?, last_error = ?, \
                     lease_until_utc = NULL, locked_by = NULL \
                 WHERE id = ?",
            )
            .bind(to_millis(now))
            .bind(detail)
            .bind(task_id)
            .execute(&mut *tx)
            .await?;

            self.append_log(
                &mut *tx,
                task_id,
                TaskEvent::DeadLettered,
                Some(&format!(
                    "{kind} failure after {attempts} attempt(s): {detail}"
                )),
            )
            .await?;

            FailureDisposition::DeadLettered
        };

        tx.commit().await?;

        match disposition {
            FailureDisposition::Retried { run_after } => {
                debug!(task_id, worker_id, %run_after, "task requeued for retry");
            }
            FailureDisposition::DeadLettered => {
                warn!(task_id, worker_id, kind = %kind, "task dead-lettered");
            }
        }
        Ok(disposition)
    }

    /// Cancels a queued task.
    ///
    /// Only `queued` tasks may be cancelled: leased work belongs to its
    /// worker until the lease resolves, and terminal tasks are immutable.
    pub async fn cancel(&self, task_id: i64) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE task_queue \
             SET status = 'failed', last_error = 'cancelled by operator', finished_at_utc = ? \
             WHERE id = ? AND status = 'queued'",
        )
        .bind(to_millis(now))
        .bind(task_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            let task = self.task(task_id).await?;
            return Err(StoreError::InvalidTransition {
                task_id,
                status: task.status,
                operation: "cancel",
            });
        }

        self.append_log(&mut *tx, task_id, TaskEvent::Failed, Some("cancelled by operator"))
            .await?;
        tx.commit().await?;

        info!(task_id, "task cancelled");
        Ok(())
    }

    /// Requeues a dead task. Manual intervention only; resets the attempt
    /// counter so the task gets a fresh budget.
    pub async fn requeue_dead(&self, task_id: i64) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE task_queue \
             SET status = 'queued', attempts = 0, run_after_utc = ?, \
                 last_error = NULL, finished_at_utc = NULL \
             WHERE id = ? AND status = 'dead'",
        )
        .bind(to_millis(now))
        .bind(task_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            let task = self.task(task_id).await?;
            return Err(StoreError::InvalidTransition {
                task_id,
                status: task.status,
                operation: "requeue",
            });
        }

        self.append_log(&mut *tx, task_id, TaskEvent::Retried, Some("manual requeue"))
            .await?;
        tx.commit().await?;

        info!(task_id, "dead task requeued");
        Ok(())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Fetches a task by id.
    pub async fn task(&self, task_id: i64) -> Result<Task, StoreError> {
        let row = sqlx::query("SELECT * FROM task_queue WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => task_from_row(&row),
            None => Err(StoreError::TaskNotFound(task_id)),
        }
    }

    /// Lists tasks, optionally filtered by status, newest first.
    pub async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        limit: i64,
    ) -> Result<Vec<Task>, StoreError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM task_queue WHERE status = ? ORDER BY id DESC LIMIT ?",
                )
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM task_queue ORDER BY id DESC LIMIT ?")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter().map(task_from_row).collect()
    }

    /// Returns the audit trail for a task, oldest first.
    pub async fn task_log(&self, task_id: i64) -> Result<Vec<TaskLogEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, task_id, event, detail, created_at_utc \
             FROM task_logs WHERE task_id = ? ORDER BY id ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let event: String = row.get("event");
                Ok(TaskLogEntry {
                    id: row.get("id"),
                    task_id: row.get("task_id"),
                    event: TaskEvent::from_str(&event)
                        .map_err(|e| StoreError::Corrupt(e.to_string()))?,
                    detail: row.get("detail"),
                    created_at: from_millis(row.get("created_at_utc")),
                })
            })
            .collect()
    }

    /// Per-status task counts.
    pub async fn stats(&self) -> Result<QueueStats, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM task_queue GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row.get("status");
            let count: i64 = row.get("n");
            let count = count as u64;
            match TaskStatus::from_str(&status)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?
            {
                TaskStatus::Queued => stats.queued = count,
                TaskStatus::Leased => stats.leased = count,
                TaskStatus::Succeeded => stats.succeeded = count,
                TaskStatus::Failed => stats.failed = count,
                TaskStatus::Dead => stats.dead = count,
            }
        }
        Ok(stats)
    }

    /// Terminal tasks that came from an external source (tasks with an
    /// idempotency key) and have not been acknowledged back to it.
    pub async fn unacked_terminal(&self, limit: i64) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM task_queue \
             WHERE status IN ('succeeded', 'failed', 'dead') \
               AND idempotency_key IS NOT NULL \
               AND source_acked_utc IS NULL \
             ORDER BY id ASC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(task_from_row).collect()
    }

    /// Marks a terminal task as acknowledged to its source.
    pub async fn mark_source_acked(&self, task_id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE task_queue SET source_acked_utc = ? WHERE id = ?")
            .bind(to_millis(Utc::now()))
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // =========================================================================
    // Worker registry
    // =========================================================================

    /// Registers a worker, or refreshes its row if already present.
    pub async fn register_worker(
        &self,
        worker_id: &str,
        capabilities: &[String],
        region: Option<&str>,
    ) -> Result<(), StoreError> {
        let now = to_millis(Utc::now());
        sqlx::query(
            "INSERT INTO workers (worker_id, capabilities, region, last_heartbeat_utc, started_at_utc) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(worker_id) DO UPDATE SET \
                 capabilities = excluded.capabilities, \
                 region = excluded.region, \
                 last_heartbeat_utc = excluded.last_heartbeat_utc",
        )
        .bind(worker_id)
        .bind(capabilities.join(","))
        .bind(region)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        info!(worker_id, "worker registered");
        Ok(())
    }

    /// Records a worker heartbeat.
    pub async fn worker_heartbeat(&self, worker_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE workers SET last_heartbeat_utc = ? WHERE worker_id = ?")
            .bind(to_millis(Utc::now()))
            .bind(worker_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::WorkerNotRegistered(worker_id.to_string()));
        }
        Ok(())
    }

    /// Removes a worker's registry row (graceful shutdown).
    pub async fn remove_worker(&self, worker_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM workers WHERE worker_id = ?")
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Lists registered workers.
    pub async fn list_workers(&self) -> Result<Vec<WorkerInfo>, StoreError> {
        let rows = sqlx::query(
            "SELECT worker_id, capabilities, region, last_heartbeat_utc, started_at_utc \
             FROM workers ORDER BY worker_id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let capabilities: String = row.get("capabilities");
                WorkerInfo {
                    worker_id: row.get("worker_id"),
                    capabilities: capabilities
                        .split(',')
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect(),
                    region: row.get("region"),
                    last_heartbeat: from_millis(row.get("last_heartbeat_utc")),
                    started_at: from_millis(row.get("started_at_utc")),
                }
            })
            .collect())
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Truncates the write-ahead log. Periodic maintenance, never run inline
    /// with claiming.
    pub async fn checkpoint(&self) -> Result<(), StoreError> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Deletes log entries older than the retention window. Returns the
    /// number of entries removed.
    pub async fn prune_logs(&self, older_than: chrono::Duration) -> Result<u64, StoreError> {
        let cutoff = to_millis(Utc::now() - older_than);
        let result = sqlx::query("DELETE FROM task_logs WHERE created_at_utc <= ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        let pruned = result.rows_affected();
        if pruned > 0 {
            info!(pruned, "task log entries pruned");
        }
        Ok(pruned)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Appends an audit log entry.
    async fn append_log<'e, E>(
        &self,
        executor: E,
        task_id: i64,
        event: TaskEvent,
        detail: Option<&str>,
    ) -> Result<(), StoreError>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        sqlx::query(
            "INSERT INTO task_logs (task_id, event, detail, created_at_utc) VALUES (?, ?, ?, ?)",
        )
        .bind(task_id)
        .bind(event.as_str())
        .bind(detail)
        .bind(to_millis(Utc::now()))
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Distinguishes "task does not exist" from "lease not held" after a
    /// guarded update affected zero rows.
    async fn lease_failure(&self, task_id: i64, worker_id: &str) -> StoreError {
        match self.task(task_id).await {
            Ok(_) => StoreError::LeaseNotHeld {
                task_id,
                worker_id: worker_id.to_string(),
            },
            Err(e) => e,
        }
    }
}

/// Converts a timestamp to the integer milliseconds stored in the database.
fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Converts stored milliseconds back to a timestamp.
fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Maps a task row to the domain type.
fn task_from_row(row: &SqliteRow) -> Result<Task, StoreError> {
    let status: String = row.get("status");
    let params: String = row.get("params");
    let result: Option<String> = row.get("result");

    Ok(Task {
        id: row.get("id"),
        task_type: row.get("task_type"),
        params: serde_json::from_str(&params)?,
        status: TaskStatus::from_str(&status).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        priority: row.get("priority"),
        attempts: row.get::<i64, _>("attempts") as u32,
        max_attempts: row.get::<i64, _>("max_attempts") as u32,
        run_after: from_millis(row.get("run_after_utc")),
        lease_until: row.get::<Option<i64>, _>("lease_until_utc").map(from_millis),
        locked_by: row.get("locked_by"),
        idempotency_key: row.get("idempotency_key"),
        result: result.as_deref().map(serde_json::from_str).transpose()?,
        last_error: row.get("last_error"),
        created_at: from_millis(row.get("created_at_utc")),
        finished_at: row.get::<Option<i64>, _>("finished_at_utc").map(from_millis),
    })
}

/// Returns whether a sqlx error is SQLITE_BUSY lock contention.
fn is_busy(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => {
            db.code().as_deref() == Some("5") || db.message().contains("database is locked")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_config_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.busy_timeout, Duration::from_secs(5));
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.claim_retries, 5);
    }

    #[test]
    fn test_store_config_builder() {
        let config = StoreConfig::default()
            .with_busy_timeout(Duration::from_secs(1))
            .with_max_connections(8);
        assert_eq!(config.busy_timeout, Duration::from_secs(1));
        assert_eq!(config.max_connections, 8);
    }

    #[test]
    fn test_millis_round_trip() {
        let now = Utc::now();
        let restored = from_millis(to_millis(now));
        // Sub-millisecond precision is dropped by the storage format.
        assert!((now - restored).num_milliseconds().abs() < 1);
    }

    #[test]
    fn test_queue_stats_total() {
        let stats = QueueStats {
            queued: 3,
            leased: 2,
            succeeded: 10,
            failed: 1,
            dead: 4,
        };
        assert_eq!(stats.total(), 20);
    }

    #[test]
    fn test_eligibility_predicate_shape() {
        // Both arms of the invariant: claimable means queued-and-due or
        // leased-with-expired-lease.
        assert!(ELIGIBLE.contains("status = 'queued' AND run_after_utc <= ?"));
        assert!(ELIGIBLE.contains("status = 'leased' AND lease_until_utc <= ?"));
    }
}
