//! Command-line interface for taskforge.
//!
//! Provides commands for running a worker host, enqueuing tasks, and queue
//! inspection/administration.

mod commands;

pub use commands::{parse_cli, run, run_with_cli};
