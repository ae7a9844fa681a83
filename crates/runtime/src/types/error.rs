//! Error types for the execution engine

use std::time::Duration;
use thiserror::Error;

/// Top-level engine error
///
/// Only construction and configuration can fail with an `EngineError`. Once a
/// request is accepted, every failure is reported through
/// [`ExecutionOutcome`](super::ExecutionOutcome) instead.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("Invalid request: {0}")]
    Request(#[from] RequestError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("IO error reading config file: {message}")]
    IoError { message: String },

    #[error("Configuration parsing error: {message}")]
    ParseError { message: String },
}

/// Rejections of an execution request before it is accepted
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("timeout_seconds must be a positive integer")]
    ZeroTimeout,

    #[error("max_output_bytes must be a positive integer")]
    ZeroOutputLimit,

    #[error("Invalid dependency identifier '{0}'")]
    InvalidDependency(String),
}

/// Failures while building the disposable environment
#[derive(Error, Debug, Clone)]
pub enum ProvisionError {
    #[error("Failed to create workspace directory: {0}")]
    Workspace(String),

    #[error("Failed to create virtual environment with '{interpreter}': {reason}")]
    VirtualEnv { interpreter: String, reason: String },

    #[error("{dependency}: {reason}")]
    DependencyInstall { dependency: String, reason: String },

    #[error("Provisioning exceeded its {0:?} deadline")]
    DeadlineExceeded(Duration),

    #[error("Provisioning was cancelled")]
    Cancelled,
}

/// Failures building or attaching a syscall policy
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("Unknown syscall '{0}'")]
    UnknownSyscall(String),

    #[error("Syscall policy resolved to an empty allow-list")]
    EmptyAllowList,

    #[error("Syscall filter too large: {0} instructions")]
    FilterTooLarge(usize),

    #[error("Syscall filtering unsupported: {0}")]
    Unsupported(String),

    #[error("Failed to {step} in the guest before exec: {reason}")]
    Confine { step: String, reason: String },
}
