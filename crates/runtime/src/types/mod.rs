//! Core types and data structures for the execution engine

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

pub mod error;
pub mod request;

pub use error::*;
pub use request::*;

/// Unique identifier for a single execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ExecutionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// How strongly the guest process is isolated from the host
///
/// `None` means no kernel syscall filter was attached: the guest still runs in
/// a throwaway environment with resource limits, but it can issue any syscall
/// the engine's own user could.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStrength {
    Full,
    None,
}

impl std::fmt::Display for SandboxStrength {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxStrength::Full => write!(f, "full"),
            SandboxStrength::None => write!(f, "none"),
        }
    }
}

/// One captured output stream, head-truncated to the request's byte cap
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    /// The earliest bytes of the stream, at most `max_output_bytes` long
    pub bytes: Vec<u8>,
    /// Whether anything past the cap was discarded
    pub truncated: bool,
    /// Total bytes the process wrote to the stream
    pub total_bytes: usize,
}

impl CapturedOutput {
    /// Lossy UTF-8 view of the retained bytes.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Result of one execution request
///
/// A non-zero `exit_code` is still `Completed`: the engine did its job and the
/// guest code failed on its own terms.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Completed {
        stdout: CapturedOutput,
        stderr: CapturedOutput,
        /// Process exit code, or `128 + signal` when killed by a signal
        exit_code: i32,
        /// Terminating signal, if any (`SIGSYS` for a syscall policy violation)
        signal: Option<i32>,
        elapsed: Duration,
    },
    TimedOut {
        elapsed: Duration,
        timeout: Duration,
    },
    ProvisioningFailed {
        cause: String,
    },
    /// The confinement could not be prepared, or the pre-exec hook failed to
    /// start a session, set a resource limit or load the filter. The guest
    /// never ran.
    PolicyFailed {
        cause: String,
    },
    /// Spawning or waiting on the interpreter failed for any other reason
    RuntimeFailure {
        cause: String,
    },
    Cancelled {
        elapsed: Duration,
    },
}

impl ExecutionOutcome {
    /// Whether the engine ran the code to completion (regardless of exit code).
    pub fn is_completed(&self) -> bool {
        matches!(self, ExecutionOutcome::Completed { .. })
    }

    /// Whether the guest code completed with exit code 0.
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Completed { exit_code: 0, .. })
    }
}

/// Everything the engine returns for a single request
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub execution_id: ExecutionId,
    pub sandbox_strength: SandboxStrength,
    pub outcome: ExecutionOutcome,
    pub started_at: chrono::DateTime<chrono::Utc>,
    /// Root of the disposable environment; already removed when the report is returned
    pub workspace: Option<PathBuf>,
}
