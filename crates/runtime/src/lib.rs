//! Ephemera execution runtime
//!
//! Runs untrusted Python code once, in a throwaway virtual environment, under a
//! seccomp syscall filter and resource limits, with a hard wall-clock deadline
//! and capped output. Every environment is destroyed when its request ends,
//! however it ends.
//!
//! ```ignore
//! use ephemera_runtime::{EngineConfig, ExecutionRequest, SandboxEngine, to_response};
//!
//! let engine = SandboxEngine::new(EngineConfig::default())?;
//! let report = engine.run(ExecutionRequest::new("print(6 * 7)")).await;
//! println!("{}", to_response(&report).to_json()?);
//! ```

pub mod config;
pub mod engine;
pub mod response;
pub mod sandbox;
pub mod types;

// Re-export commonly used types
pub use config::{EngineConfig, LogFormat, ResourceLimits};
pub use engine::SandboxEngine;
pub use response::{to_response, ErrorKind, ExecutionResponse};
pub use sandbox::{Capabilities, PolicyMode};
pub use types::*;

pub use tokio_util::sync::CancellationToken;
