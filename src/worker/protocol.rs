//! JSON-over-stdio worker contract.
//!
//! The coordinator writes one JSON request to the subprocess's stdin and
//! expects one JSON response on stdout before exit. No streaming, no partial
//! messages. The exit code carries a coarse signal independent of the JSON
//! body; when the two disagree the classification leans toward retry, and a
//! missing or malformed response is always treated as a crash (retryable).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scheduler::{FailureKind, Task};

/// Exit codes a well-behaved worker uses. Any other code is a crash.
pub mod exit_codes {
    /// Task succeeded; stdout carries the result.
    pub const SUCCESS: i32 = 0;
    /// Task failed but may succeed on retry.
    pub const RETRYABLE: i32 = 1;
    /// Task failed and will never succeed; dead-letter it.
    pub const PERMANENT: i32 = 2;
    /// The worker gave up on an internal deadline.
    pub const TIMEOUT: i32 = 3;
}

/// The request written to a worker's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkRequest {
    /// Queue row id.
    pub id: i64,
    /// Task type; the worker was selected because it handles this type.
    #[serde(rename = "type")]
    pub task_type: String,
    /// Opaque payload.
    pub params: serde_json::Value,
    /// Attempt bookkeeping the worker may use for its own logging.
    pub metadata: RequestMetadata,
}

/// Attempt context attached to every request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMetadata {
    /// Attempts already consumed before this one.
    pub attempt: u32,
    /// Retry budget.
    pub max_attempts: u32,
    /// When the current lease expires.
    pub lease_until: Option<DateTime<Utc>>,
}

impl WorkRequest {
    /// Builds the request for a claimed task.
    pub fn for_task(task: &Task) -> Self {
        Self {
            id: task.id,
            task_type: task.task_type.clone(),
            params: task.params.clone(),
            metadata: RequestMetadata {
                attempt: task.attempts,
                max_attempts: task.max_attempts,
                lease_until: task.lease_until,
            },
        }
    }
}

/// The single JSON object a worker writes to stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkResponse {
    /// Whether the task succeeded.
    pub success: bool,
    /// Result payload; present on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error details; present on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

/// Error body of a failed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseError {
    /// Machine-readable error class, e.g. `"timeout"` or `"invalid-params"`.
    #[serde(rename = "type")]
    pub error_type: String,
    /// Human-readable description.
    pub message: String,
    /// Whether a retry could succeed. Defaults to true when omitted.
    #[serde(default = "default_retry_possible")]
    pub retry_possible: bool,
}

fn default_retry_possible() -> bool {
    true
}

/// What a finished subprocess means for the task.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkOutcome {
    /// The task succeeded with this result.
    Success(serde_json::Value),
    /// The task failed.
    Failure {
        /// Retry or dead-letter.
        kind: FailureKind,
        /// Machine-readable error class.
        error_type: String,
        /// Human-readable description.
        message: String,
    },
}

impl WorkOutcome {
    fn crash(message: impl Into<String>) -> Self {
        WorkOutcome::Failure {
            kind: FailureKind::Retryable,
            error_type: "crash".to_string(),
            message: message.into(),
        }
    }

    /// Classifies a finished subprocess from its exit code and stdout.
    ///
    /// `exit_code` is `None` when the process was killed by a signal.
    pub fn classify(exit_code: Option<i32>, stdout: &str) -> Self {
        let response: Option<WorkResponse> = serde_json::from_str(stdout.trim()).ok();

        match (exit_code, response) {
            (Some(exit_codes::SUCCESS), Some(response)) if response.success => {
                WorkOutcome::Success(response.result.unwrap_or(serde_json::Value::Null))
            }
            // A zero exit with a failure body, or a nonzero exit with a
            // success body: the streams disagree, treat as a crash.
            (Some(exit_codes::SUCCESS), Some(_)) => {
                WorkOutcome::crash("worker exited 0 but reported failure")
            }
            (Some(code), Some(response)) if response.success => {
                WorkOutcome::crash(format!("worker exited {code} but reported success"))
            }
            (Some(code), Some(response)) => {
                let error = response.error.unwrap_or_else(|| ResponseError {
                    error_type: "unknown".to_string(),
                    message: format!("worker exited {code} with no error body"),
                    retry_possible: true,
                });
                let kind = if code == exit_codes::PERMANENT || !error.retry_possible {
                    FailureKind::Permanent
                } else {
                    FailureKind::Retryable
                };
                WorkOutcome::Failure {
                    kind,
                    error_type: error.error_type,
                    message: error.message,
                }
            }
            (Some(code), None) => WorkOutcome::crash(format!(
                "worker exited {code} with missing or malformed output"
            )),
            (None, _) => WorkOutcome::crash("worker killed by signal"),
        }
    }

    /// Whether this outcome is a success.
    pub fn is_success(&self) -> bool {
        matches!(self, WorkOutcome::Success(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_round_trip() {
        let outcome = WorkOutcome::classify(
            Some(0),
            r#"{"success": true, "result": {"pages": 3}}"#,
        );
        assert_eq!(outcome, WorkOutcome::Success(json!({"pages": 3})));
    }

    #[test]
    fn test_success_without_result_is_null() {
        let outcome = WorkOutcome::classify(Some(0), r#"{"success": true}"#);
        assert_eq!(outcome, WorkOutcome::Success(serde_json::Value::Null));
    }

    #[test]
    fn test_retryable_failure() {
        let outcome = WorkOutcome::classify(
            Some(1),
            r#"{"success": false, "error": {"type": "timeout", "message": "upstream slow", "retry_possible": true}}"#,
        );
        match outcome {
            WorkOutcome::Failure {
                kind, error_type, ..
            } => {
                assert_eq!(kind, FailureKind::Retryable);
                assert_eq!(error_type, "timeout");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_permanent_exit_code_wins() {
        // retry_possible true in the body, but exit code 2 says permanent.
        let outcome = WorkOutcome::classify(
            Some(2),
            r#"{"success": false, "error": {"type": "bad-params", "message": "no url", "retry_possible": true}}"#,
        );
        assert!(matches!(
            outcome,
            WorkOutcome::Failure {
                kind: FailureKind::Permanent,
                ..
            }
        ));
    }

    #[test]
    fn test_retry_possible_false_is_permanent() {
        let outcome = WorkOutcome::classify(
            Some(1),
            r#"{"success": false, "error": {"type": "auth", "message": "denied", "retry_possible": false}}"#,
        );
        assert!(matches!(
            outcome,
            WorkOutcome::Failure {
                kind: FailureKind::Permanent,
                ..
            }
        ));
    }

    #[test]
    fn test_malformed_output_is_crash() {
        let outcome = WorkOutcome::classify(Some(0), "Traceback (most recent call last):");
        match outcome {
            WorkOutcome::Failure {
                kind, error_type, ..
            } => {
                assert_eq!(kind, FailureKind::Retryable);
                assert_eq!(error_type, "crash");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_signal_death_is_crash() {
        let outcome = WorkOutcome::classify(None, "");
        assert!(matches!(
            outcome,
            WorkOutcome::Failure {
                kind: FailureKind::Retryable,
                ..
            }
        ));
    }

    #[test]
    fn test_exit_zero_with_failure_body_is_crash() {
        let outcome = WorkOutcome::classify(
            Some(0),
            r#"{"success": false, "error": {"type": "x", "message": "y"}}"#,
        );
        match outcome {
            WorkOutcome::Failure { error_type, .. } => assert_eq!(error_type, "crash"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_request_serialization_uses_type_key() {
        let request = WorkRequest {
            id: 7,
            task_type: "scrape.page".to_string(),
            params: json!({"url": "https://example.com"}),
            metadata: RequestMetadata {
                attempt: 0,
                max_attempts: 3,
                lease_until: None,
            },
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["type"], "scrape.page");
        assert_eq!(value["metadata"]["max_attempts"], 3);
    }
}
