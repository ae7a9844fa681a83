//! Configuration management for the execution engine
//!
//! Provides centralized configuration handling with validation, environment
//! variable overrides, and conservative defaults.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

use crate::sandbox::PolicyMode;
use crate::types::{ConfigError, DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_TIMEOUT_SECONDS};

/// Main engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Interpreter used to create environments
    pub interpreter: InterpreterConfig,
    /// Environment provisioning
    pub provisioning: ProvisioningConfig,
    /// Per-request defaults
    pub execution: ExecutionDefaults,
    /// Syscall filtering
    pub policy: PolicyConfig,
    /// Resource limits applied to the guest process
    pub limits: ResourceLimits,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Upper bound on executions running at the same time
    pub max_concurrent_executions: usize,
}

/// Interpreter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterConfig {
    /// Host interpreter used to create each virtual environment (read-only to the engine)
    pub executable: String,
}

/// Provisioning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Directory under which disposable environments are created (system temp dir if unset)
    pub base_dir: Option<PathBuf>,
    /// Deadline for creating the environment and installing all dependencies
    pub timeout_seconds: u64,
}

/// Defaults applied when a caller does not specify limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionDefaults {
    pub timeout_seconds: u64,
    pub max_output_bytes: usize,
}

/// Syscall policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub mode: PolicyMode,
    /// Additional syscall names appended to the mode's allow-list
    pub extra_syscalls: Vec<String>,
}

/// Resource limits enforced through rlimits before exec
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Address-space limit in MB
    pub max_memory_mb: Option<u64>,
    /// CPU time limit in seconds
    pub max_cpu_seconds: Option<u64>,
    /// Largest file the guest may write, in MB
    pub max_file_size_mb: Option<u64>,
    /// Maximum number of open file descriptors
    pub max_open_files: Option<u64>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format
    pub format: LogFormat,
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            interpreter: InterpreterConfig::default(),
            provisioning: ProvisioningConfig::default(),
            execution: ExecutionDefaults::default(),
            policy: PolicyConfig::default(),
            limits: ResourceLimits::default(),
            logging: LoggingConfig::default(),
            max_concurrent_executions: 8,
        }
    }
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            executable: "python3".to_string(),
        }
    }
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            base_dir: None,
            timeout_seconds: 300,
        }
    }
}

impl Default for ExecutionDefaults {
    fn default() -> Self {
        Self {
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            mode: PolicyMode::Interpreter,
            extra_syscalls: vec![],
        }
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_mb: Some(1024),
            max_cpu_seconds: None,
            max_file_size_mb: Some(100),
            max_open_files: Some(256),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables and defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            message: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

        Ok(config)
    }

    /// Load the optional file, overlay environment variables, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(python) = env::var("EPHEMERA_PYTHON") {
            self.interpreter.executable = python;
        }

        if let Some(seconds) = parse_env::<u64>("EPHEMERA_TIMEOUT_SECONDS")? {
            self.execution.timeout_seconds = seconds;
        }

        if let Some(bytes) = parse_env::<usize>("EPHEMERA_MAX_OUTPUT_BYTES")? {
            self.execution.max_output_bytes = bytes;
        }

        if let Some(seconds) = parse_env::<u64>("EPHEMERA_PROVISION_TIMEOUT_SECONDS")? {
            self.provisioning.timeout_seconds = seconds;
        }

        if let Some(mode) = parse_env::<PolicyMode>("EPHEMERA_POLICY_MODE")? {
            self.policy.mode = mode;
        }

        if let Ok(dir) = env::var("EPHEMERA_WORK_DIR") {
            self.provisioning.base_dir = Some(PathBuf::from(dir));
        }

        if let Some(limit) = parse_env::<usize>("EPHEMERA_MAX_CONCURRENT")? {
            self.max_concurrent_executions = limit;
        }

        if let Ok(level) = env::var("LOG_LEVEL") {
            self.logging.level = level.to_lowercase();
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interpreter.executable.trim().is_empty() {
            return Err(invalid("interpreter.executable", "Must not be empty"));
        }

        if self.execution.timeout_seconds == 0 {
            return Err(invalid("execution.timeout_seconds", "Must be > 0"));
        }

        if self.execution.max_output_bytes == 0 {
            return Err(invalid("execution.max_output_bytes", "Must be > 0"));
        }

        if self.provisioning.timeout_seconds == 0 {
            return Err(invalid("provisioning.timeout_seconds", "Must be > 0"));
        }

        if let Some(dir) = &self.provisioning.base_dir {
            if !dir.is_absolute() {
                return Err(invalid(
                    "provisioning.base_dir",
                    &format!("Must be an absolute path: {}", dir.display()),
                ));
            }
        }

        if self.max_concurrent_executions == 0 {
            return Err(invalid("max_concurrent_executions", "Must be > 0"));
        }

        for (key, value) in [
            ("limits.max_memory_mb", self.limits.max_memory_mb),
            ("limits.max_cpu_seconds", self.limits.max_cpu_seconds),
            ("limits.max_file_size_mb", self.limits.max_file_size_mb),
            ("limits.max_open_files", self.limits.max_open_files),
        ] {
            if value == Some(0) {
                return Err(invalid(key, "Must be > 0 when set"));
            }
        }

        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(invalid(
                "logging.level",
                &format!("Must be one of: {}", valid_levels.join(", ")),
            ));
        }

        Ok(())
    }
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| invalid(key, &format!("Cannot parse '{}'", raw))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.execution.timeout_seconds, 30);
        assert_eq!(config.execution.max_output_bytes, 10240);
        assert_eq!(config.interpreter.executable, "python3");
        assert_eq!(config.policy.mode, PolicyMode::Interpreter);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
            max_concurrent_executions = 2

            [execution]
            timeout_seconds = 5

            [policy]
            mode = "minimal"
            extra_syscalls = ["getrandom"]

            [logging]
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.max_concurrent_executions, 2);
        assert_eq!(config.execution.timeout_seconds, 5);
        assert_eq!(config.execution.max_output_bytes, 10240);
        assert_eq!(config.policy.mode, PolicyMode::Minimal);
        assert_eq!(config.policy.extra_syscalls, vec!["getrandom".to_string()]);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.limits.max_memory_mb, Some(1024));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ephemera.toml");
        std::fs::write(&path, "[interpreter]\nexecutable = \"/usr/bin/python3\"\n").unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.interpreter.executable, "/usr/bin/python3");

        std::fs::write(&path, "[execution\n").unwrap();
        assert!(matches!(
            EngineConfig::from_file(&path),
            Err(ConfigError::ParseError { .. })
        ));

        assert!(matches!(
            EngineConfig::from_file(dir.path().join("missing.toml")),
            Err(ConfigError::IoError { .. })
        ));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.execution.timeout_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.provisioning.base_dir = Some(PathBuf::from("relative/dir"));
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.limits.max_open_files = Some(0);
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.interpreter.executable = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        env::set_var("EPHEMERA_TIMEOUT_SECONDS", "7");
        env::set_var("EPHEMERA_POLICY_MODE", "disabled");
        env::set_var("EPHEMERA_PYTHON", "python3.12");
        env::set_var("LOG_LEVEL", "DEBUG");

        let config = EngineConfig::from_env().unwrap();
        assert_eq!(config.execution.timeout_seconds, 7);
        assert_eq!(config.policy.mode, PolicyMode::Disabled);
        assert_eq!(config.interpreter.executable, "python3.12");
        assert_eq!(config.logging.level, "debug");

        env::remove_var("EPHEMERA_TIMEOUT_SECONDS");
        env::remove_var("EPHEMERA_POLICY_MODE");
        env::remove_var("EPHEMERA_PYTHON");
        env::remove_var("LOG_LEVEL");
    }

    #[test]
    #[serial]
    fn test_env_parse_error() {
        env::set_var("EPHEMERA_MAX_OUTPUT_BYTES", "lots");
        let result = EngineConfig::from_env();
        env::remove_var("EPHEMERA_MAX_OUTPUT_BYTES");

        match result {
            Err(ConfigError::InvalidValue { key, .. }) => {
                assert_eq!(key, "EPHEMERA_MAX_OUTPUT_BYTES")
            }
            other => panic!("expected InvalidValue, got {:?}", other),
        }
    }
}
