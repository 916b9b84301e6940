//! Worker configuration.
//!
//! Worker entries are loaded once at coordinator startup from a YAML or JSON
//! file and mapped into a task-type registry. There is no hot reload; config
//! changes require a restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Default subprocess timeout when an entry does not set one.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 300;

/// Default per-worker concurrency bound.
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Errors raised while loading or validating worker configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path that failed.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The file content is not valid YAML/JSON for the expected shape.
    #[error("failed to parse config file {path}: {message}")]
    Parse {
        /// Path that failed.
        path: PathBuf,
        /// Parser diagnostic.
        message: String,
    },

    /// No worker entries were defined.
    #[error("config defines no workers")]
    Empty,

    /// A worker entry has no task types.
    #[error("worker '{0}' handles no task types")]
    NoTaskTypes(String),

    /// Two worker entries handle the same task type.
    #[error("task type '{task_type}' is handled by both '{first}' and '{second}'")]
    DuplicateTaskType {
        /// The contested type.
        task_type: String,
        /// Worker that registered it first.
        first: String,
        /// Worker that tried to register it again.
        second: String,
    },
}

/// One worker executable and the task types it handles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Human-readable worker name.
    pub name: String,
    /// Task types routed to this worker.
    pub task_types: Vec<String>,
    /// Executable to spawn.
    pub command: String,
    /// Arguments passed to the executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables for the subprocess.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the subprocess.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Hard wall-clock limit per task.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// How many tasks of this worker's types may run at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

fn default_timeout_seconds() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}

fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}

impl WorkerConfig {
    /// The subprocess timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Immutable task-type → worker routing table.
#[derive(Debug, Clone, Default)]
pub struct WorkerRegistry {
    by_type: HashMap<String, Arc<WorkerConfig>>,
}

impl WorkerRegistry {
    /// Builds a registry from worker entries, rejecting duplicate task types.
    pub fn from_configs(configs: Vec<WorkerConfig>) -> Result<Self, ConfigError> {
        if configs.is_empty() {
            return Err(ConfigError::Empty);
        }

        let mut by_type: HashMap<String, Arc<WorkerConfig>> = HashMap::new();
        for config in configs {
            if config.task_types.is_empty() {
                return Err(ConfigError::NoTaskTypes(config.name));
            }
            let config = Arc::new(config);
            for task_type in &config.task_types {
                if let Some(existing) = by_type.get(task_type) {
                    return Err(ConfigError::DuplicateTaskType {
                        task_type: task_type.clone(),
                        first: existing.name.clone(),
                        second: config.name.clone(),
                    });
                }
                by_type.insert(task_type.clone(), Arc::clone(&config));
            }
        }

        Ok(Self { by_type })
    }

    /// Loads and validates a registry from a YAML or JSON file. The format
    /// is chosen by extension; anything that is not `.json` is parsed as
    /// YAML (which also accepts JSON).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let configs: Vec<WorkerConfig> = if path.extension().is_some_and(|e| e == "json") {
            serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
        } else {
            serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
        };

        let registry = Self::from_configs(configs)?;
        info!(
            path = %path.display(),
            task_types = registry.by_type.len(),
            "worker registry loaded"
        );
        Ok(registry)
    }

    /// Returns the worker handling a task type, if any.
    pub fn worker_for(&self, task_type: &str) -> Option<&Arc<WorkerConfig>> {
        self.by_type.get(task_type)
    }

    /// All task types the registry can route.
    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.by_type.keys().cloned().collect();
        types.sort();
        types
    }

    /// Number of routable task types.
    pub fn len(&self) -> usize {
        self.by_type.len()
    }

    /// Whether the registry has no routes.
    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }
}
