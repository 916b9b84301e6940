//! Task model, scheduling strategies and retry policy.
//!
//! This module defines the vocabulary the rest of the crate works in:
//!
//! - **Task**: a persisted unit of work with status, priority, attempt budget
//!   and lease fields
//! - **SchedulingStrategy**: the pure ordering policy applied when selecting
//!   the next claimable task (FIFO, LIFO, Priority, Weighted-Random)
//! - **RetryPolicy** / **FailureKind**: how failures are classified and when
//!   a retried task becomes eligible again
//!
//! # Task state machine
//!
//! ```text
//!                    ┌───────────┐
//!        enqueue ───▶│  queued   │◀──── retry (run_after = now + backoff)
//!                    └─────┬─────┘
//!                    claim │  ▲ lease expiry (lazy reclaim)
//!                    ┌─────▼─────┐
//!                    │  leased   │
//!                    └─────┬─────┘
//!              ┌───────────┼─────────────┐
//!              ▼           ▼             ▼
//!        ┌───────────┐ ┌────────┐  ┌──────────┐
//!        │ succeeded │ │ failed │  │   dead   │
//!        └───────────┘ └────────┘  └──────────┘
//! ```
//!
//! Terminal states are never left automatically; `dead` tasks require manual
//! requeueing.

pub mod retry;
pub mod strategy;
pub mod task;

// Re-export main types for convenience
pub use retry::{FailureKind, RetryPolicy};
pub use strategy::{ClaimCandidate, SchedulingStrategy, DEFAULT_WEIGHTED_TOP_K};
pub use task::{NewTask, Task, TaskEvent, TaskLogEntry, TaskStatus, WorkerInfo};
