//! Execution requests

use std::time::Duration;

use super::RequestError;

/// Default wall-clock budget for guest code
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

/// Default per-stream output cap in bytes
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 10240;

/// A validated, immutable request to run one piece of code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    code: String,
    extra_dependencies: Vec<String>,
    timeout_seconds: u64,
    max_output_bytes: usize,
}

impl ExecutionRequest {
    /// Build a request with the default timeout and output cap and no extra dependencies.
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            extra_dependencies: Vec::new(),
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    /// Build and validate a request in one step.
    pub fn build(
        code: impl Into<String>,
        extra_dependencies: Vec<String>,
        timeout_seconds: u64,
        max_output_bytes: usize,
    ) -> Result<Self, RequestError> {
        Self::new(code)
            .with_dependencies(extra_dependencies)?
            .with_timeout_seconds(timeout_seconds)?
            .with_max_output_bytes(max_output_bytes)
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Result<Self, RequestError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let dependencies: Vec<String> = dependencies.into_iter().map(Into::into).collect();
        for dependency in &dependencies {
            validate_dependency(dependency)?;
        }
        self.extra_dependencies = dependencies;
        Ok(self)
    }

    pub fn with_timeout_seconds(mut self, timeout_seconds: u64) -> Result<Self, RequestError> {
        if timeout_seconds == 0 {
            return Err(RequestError::ZeroTimeout);
        }
        self.timeout_seconds = timeout_seconds;
        Ok(self)
    }

    pub fn with_max_output_bytes(mut self, max_output_bytes: usize) -> Result<Self, RequestError> {
        if max_output_bytes == 0 {
            return Err(RequestError::ZeroOutputLimit);
        }
        self.max_output_bytes = max_output_bytes;
        Ok(self)
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn extra_dependencies(&self) -> &[String] {
        &self.extra_dependencies
    }

    pub fn timeout_seconds(&self) -> u64 {
        self.timeout_seconds
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn max_output_bytes(&self) -> usize {
        self.max_output_bytes
    }
}

/// Reject identifiers the installer could mistake for options or split into several arguments.
pub fn validate_dependency(name: &str) -> Result<(), RequestError> {
    let invalid = name.is_empty()
        || name.starts_with('-')
        || name.chars().any(|c| c.is_whitespace() || c.is_control());
    if invalid {
        return Err(RequestError::InvalidDependency(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let request = ExecutionRequest::new("print(1)");
        assert_eq!(request.code(), "print(1)");
        assert!(request.extra_dependencies().is_empty());
        assert_eq!(request.timeout_seconds(), 30);
        assert_eq!(request.timeout(), Duration::from_secs(30));
        assert_eq!(request.max_output_bytes(), 10240);
    }

    #[test]
    fn test_zero_limits_rejected() {
        assert_eq!(
            ExecutionRequest::new("x").with_timeout_seconds(0),
            Err(RequestError::ZeroTimeout)
        );
        assert_eq!(
            ExecutionRequest::new("x").with_max_output_bytes(0),
            Err(RequestError::ZeroOutputLimit)
        );
    }

    #[test]
    fn test_dependency_order_preserved() {
        let request = ExecutionRequest::build(
            "import six",
            vec!["six".into(), "requests==2.31.0".into(), "attrs[tests]".into()],
            5,
            100,
        )
        .unwrap();
        assert_eq!(
            request.extra_dependencies(),
            &["six", "requests==2.31.0", "attrs[tests]"]
        );
    }

    #[test]
    fn test_option_like_dependencies_rejected() {
        for bad in ["", "--index-url=http://evil", "-e", "six requests", "six\n"] {
            let result = ExecutionRequest::new("x").with_dependencies([bad]);
            assert_eq!(
                result,
                Err(RequestError::InvalidDependency(bad.to_string())),
                "{:?} should be rejected",
                bad
            );
        }
    }
}
