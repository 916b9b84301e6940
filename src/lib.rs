//! taskforge: persistent task queue and worker coordination.
//!
//! This library provides a crash-recoverable task queue over a single
//! SQLite file, an atomic claim protocol with pluggable scheduling
//! strategies, retry/dead-letter handling, and a coordinator that routes
//! claimed tasks to worker subprocesses over a JSON-on-stdio protocol.

// Core modules
pub mod cli;
pub mod coordinator;
pub mod scheduler;
pub mod storage;
pub mod worker;

// Re-export commonly used types
pub use coordinator::{HostConfig, WorkerHost};
pub use scheduler::{NewTask, RetryPolicy, SchedulingStrategy, Task, TaskStatus};
pub use storage::{StoreConfig, StoreError, TaskStore};
pub use worker::WorkerRegistry;
