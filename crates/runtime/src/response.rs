//! Serializable results returned to callers
//!
//! Every [`ExecutionReport`] maps to exactly one [`ExecutionResponse`]. Engine
//! failures and guest failures stay distinguishable: a guest that exits
//! non-zero is still `completed`, with its own `exit_code` and stderr.

use serde::{Deserialize, Serialize};

use crate::types::{ExecutionId, ExecutionOutcome, ExecutionReport, SandboxStrength};

/// Why the engine could not produce a `completed` response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TimedOut,
    ProvisioningFailed,
    PolicyFailed,
    RuntimeFailure,
    Cancelled,
}

/// Wire shape of an execution result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionResponse {
    Completed {
        stdout: String,
        stderr: String,
        exit_code: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<i32>,
        stdout_truncated: bool,
        stderr_truncated: bool,
        elapsed_ms: u64,
        sandbox: SandboxStrength,
        execution_id: ExecutionId,
    },
    Error {
        kind: ErrorKind,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        elapsed_ms: Option<u64>,
        sandbox: SandboxStrength,
        execution_id: ExecutionId,
    },
}

impl ExecutionResponse {
    /// Whether the engine itself failed (as opposed to the guest code).
    pub fn is_error(&self) -> bool {
        matches!(self, ExecutionResponse::Error { .. })
    }

    pub fn execution_id(&self) -> ExecutionId {
        match self {
            ExecutionResponse::Completed { execution_id, .. }
            | ExecutionResponse::Error { execution_id, .. } => *execution_id,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Convert an engine report into its response.
pub fn to_response(report: &ExecutionReport) -> ExecutionResponse {
    let sandbox = report.sandbox_strength;
    let execution_id = report.execution_id;

    let error = |kind: ErrorKind, error: String, elapsed_ms: Option<u64>| ExecutionResponse::Error {
        kind,
        error,
        elapsed_ms,
        sandbox,
        execution_id,
    };

    match &report.outcome {
        ExecutionOutcome::Completed {
            stdout,
            stderr,
            exit_code,
            signal,
            elapsed,
        } => ExecutionResponse::Completed {
            stdout: stdout.to_string_lossy(),
            stderr: stderr.to_string_lossy(),
            exit_code: *exit_code,
            signal: *signal,
            stdout_truncated: stdout.truncated,
            stderr_truncated: stderr.truncated,
            elapsed_ms: elapsed.as_millis() as u64,
            sandbox,
            execution_id,
        },
        ExecutionOutcome::TimedOut { elapsed, timeout } => error(
            ErrorKind::TimedOut,
            format!(
                "Timeout ({}s) exceeded during code execution.",
                timeout.as_secs()
            ),
            Some(elapsed.as_millis() as u64),
        ),
        ExecutionOutcome::ProvisioningFailed { cause } => error(
            ErrorKind::ProvisioningFailed,
            format!("Failed to provision execution environment: {}", cause),
            None,
        ),
        ExecutionOutcome::PolicyFailed { cause } => error(
            ErrorKind::PolicyFailed,
            format!("Failed to apply syscall policy: {}", cause),
            None,
        ),
        ExecutionOutcome::RuntimeFailure { cause } => {
            error(ErrorKind::RuntimeFailure, cause.clone(), None)
        }
        ExecutionOutcome::Cancelled { elapsed } => error(
            ErrorKind::Cancelled,
            "Execution was cancelled by the caller.".to_string(),
            Some(elapsed.as_millis() as u64),
        ),
    }
}

impl From<&ExecutionReport> for ExecutionResponse {
    fn from(report: &ExecutionReport) -> Self {
        to_response(report)
    }
}
