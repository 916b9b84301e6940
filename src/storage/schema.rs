//! Database schema constants.
//!
//! All SQL schema definitions for the SQLite queue store. Statements are
//! idempotent (IF NOT EXISTS) so applying them on every open is safe.

/// SQL schema for creating the task queue table.
pub const CREATE_TASK_QUEUE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS task_queue (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    task_type         TEXT    NOT NULL,
    params            TEXT    NOT NULL,
    status            TEXT    NOT NULL DEFAULT 'queued',
    priority          INTEGER NOT NULL DEFAULT 0,
    attempts          INTEGER NOT NULL DEFAULT 0,
    max_attempts      INTEGER NOT NULL DEFAULT 3,
    run_after_utc     INTEGER NOT NULL,
    lease_until_utc   INTEGER,
    locked_by         TEXT,
    idempotency_key   TEXT    UNIQUE,
    result            TEXT,
    last_error        TEXT,
    source_acked_utc  INTEGER,
    created_at_utc    INTEGER NOT NULL,
    finished_at_utc   INTEGER
)
"#;

/// SQL schema for creating the worker registry table.
pub const CREATE_WORKERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS workers (
    worker_id          TEXT    PRIMARY KEY,
    capabilities       TEXT    NOT NULL DEFAULT '',
    region             TEXT,
    last_heartbeat_utc INTEGER NOT NULL,
    started_at_utc     INTEGER NOT NULL
)
"#;

/// SQL schema for creating the append-only task log table.
pub const CREATE_TASK_LOGS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS task_logs (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id        INTEGER NOT NULL,
    event          TEXT    NOT NULL,
    detail         TEXT,
    created_at_utc INTEGER NOT NULL
)
"#;

/// Compound index backing the claim query `(status, priority, run_after, id)`.
pub const CREATE_CLAIM_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_task_queue_claim
    ON task_queue(status, priority, run_after_utc, id)
"#;

/// Index for looking up a task's audit trail.
pub const CREATE_TASK_LOGS_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_task_logs_task ON task_logs(task_id, id)
"#;

/// Returns all schema creation statements in the correct order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_TASK_QUEUE_TABLE,
        CREATE_WORKERS_TABLE,
        CREATE_TASK_LOGS_TABLE,
        CREATE_CLAIM_INDEX,
        CREATE_TASK_LOGS_INDEX,
    ]
}

/// Table names in the schema.
pub mod tables {
    /// Task queue table name.
    pub const TASK_QUEUE: &str = "task_queue";
    /// Worker registry table name.
    pub const WORKERS: &str = "workers";
    /// Task log table name.
    pub const TASK_LOGS: &str = "task_logs";
}
