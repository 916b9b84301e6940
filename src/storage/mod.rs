//! Persistence layer.
//!
//! A single SQLite file holds the queue, the worker registry and the task
//! audit log:
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                taskforge.db                  │
//! │                                             │
//! │  task_queue   one row per task, the state   │
//! │               machine lives here            │
//! │  workers      heartbeat registry             │
//! │  task_logs    append-only audit trail        │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! [`store::TaskStore`] is the only entry point; schema definitions live in
//! [`schema`].

pub mod schema;
pub mod store;

// Re-export main types for convenience
pub use store::{
    ClaimRequest, Enqueued, FailureDisposition, QueueStats, StoreConfig, StoreError, TaskStore,
};
