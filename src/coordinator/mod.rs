//! Host coordination.
//!
//! ```text
//!   external source ──▶ SourceIngest ──▶ TaskStore ◀── enqueue (CLI, embedders)
//!                                            │
//!                                        claim loop ×N
//!                                            │
//!                                       WorkerHost ──▶ worker subprocess
//!                                            │
//!                                    complete / fail ──▶ TaskStore
//! ```
//!
//! [`host::WorkerHost`] owns the claim loops and subprocess supervision;
//! [`source::TaskSource`] is the boundary to external task systems.

pub mod host;
pub mod source;

// Re-export main types for convenience
pub use host::{HostConfig, HostError, HostStats, WorkerHost};
pub use source::{HttpTaskSource, SourceIngest, SourceTask, TaskSource};
