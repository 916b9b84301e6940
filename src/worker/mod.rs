//! Worker subprocess contract and execution.
//!
//! A worker is an external executable that handles one task per invocation:
//!
//! ```text
//!   coordinator                      worker subprocess
//!   ───────────                      ─────────────────
//!   WorkRequest (JSON)  ──stdin──▶   reads one object
//!                                    does the work
//!   WorkResponse (JSON) ◀─stdout──   writes one object, exits
//! ```
//!
//! [`config`] loads the task-type routing table, [`protocol`] defines the
//! wire types and outcome classification, [`runner`] spawns and supervises
//! the subprocess.

pub mod config;
pub mod protocol;
pub mod runner;

// Re-export main types for convenience
pub use config::{ConfigError, WorkerConfig, WorkerRegistry};
pub use protocol::{WorkOutcome, WorkRequest, WorkResponse};
pub use runner::{run_worker, RunnerError};
