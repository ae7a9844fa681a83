//! Environment provisioning
//!
//! Creates a fresh virtual environment per request with the host interpreter
//! and installs the requested packages into it, one at a time and in order.
//! The host installation is only ever read; every write lands in the new tree.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::environment::Environment;
use super::output::tail;
use crate::config::EngineConfig;
use crate::types::{validate_dependency, ExecutionId, ProvisionError};

/// How much installer stderr to keep in a failure cause
const STDERR_TAIL_CHARS: usize = 800;

/// Builds disposable environments
#[derive(Debug, Clone)]
pub struct Provisioner {
    interpreter: String,
    base_dir: Option<PathBuf>,
    deadline: Duration,
}

impl Provisioner {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            interpreter: config.interpreter.executable.clone(),
            base_dir: config.provisioning.base_dir.clone(),
            deadline: Duration::from_secs(config.provisioning.timeout_seconds),
        }
    }

    pub fn interpreter(&self) -> &str {
        &self.interpreter
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Create the empty environment directory.
    ///
    /// The returned [`Environment`] owns the tree from this point on, so a
    /// failure in [`populate`](Self::populate) still gets cleaned up.
    pub fn create(&self, id: ExecutionId) -> Result<Environment, ProvisionError> {
        let prefix = format!("ephemera-{}-", id);
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);

        let dir = match &self.base_dir {
            Some(base) => {
                std::fs::create_dir_all(base).map_err(|e| {
                    ProvisionError::Workspace(format!("{}: {}", base.display(), e))
                })?;
                builder.tempdir_in(base)
            }
            None => builder.tempdir(),
        }
        .map_err(|e| ProvisionError::Workspace(e.to_string()))?;

        tracing::debug!(execution_id = %id, "Created environment root {}", dir.path().display());
        Ok(Environment::new(id, dir))
    }

    /// Build the virtual environment and install `dependencies` into it,
    /// bounded by the provisioning deadline and `cancel`.
    pub async fn populate(
        &self,
        env: &Environment,
        dependencies: &[String],
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        let bounded = tokio::time::timeout(self.deadline, self.populate_inner(env, dependencies));
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProvisionError::Cancelled),
            result = bounded => {
                match result {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::warn!(
                            execution_id = %env.id(),
                            "Provisioning exceeded {:?} deadline",
                            self.deadline
                        );
                        Err(ProvisionError::DeadlineExceeded(self.deadline))
                    }
                }
            }
        }
    }

    /// `create` followed by `populate`; the environment is released on failure.
    pub async fn provision(
        &self,
        id: ExecutionId,
        dependencies: &[String],
        cancel: &CancellationToken,
    ) -> Result<Environment, ProvisionError> {
        let mut env = self.create(id)?;
        if let Err(e) = self.populate(&env, dependencies, cancel).await {
            env.release();
            return Err(e);
        }
        Ok(env)
    }

    async fn populate_inner(
        &self,
        env: &Environment,
        dependencies: &[String],
    ) -> Result<(), ProvisionError> {
        let venv_failed = |reason: String| ProvisionError::VirtualEnv {
            interpreter: self.interpreter.clone(),
            reason,
        };

        tokio::fs::create_dir(env.work_dir())
            .await
            .map_err(|e| ProvisionError::Workspace(e.to_string()))?;

        let mut venv = Command::new(&self.interpreter);
        venv.arg("-m").arg("venv");
        if dependencies.is_empty() {
            venv.arg("--without-pip");
        }
        venv.arg(env.venv_dir());

        let started = std::time::Instant::now();
        let result = run_tool(env, venv).await.map_err(venv_failed)?;
        if !result.success {
            return Err(venv_failed(tail(&result.stderr, STDERR_TAIL_CHARS)));
        }
        if !env.interpreter().exists() {
            return Err(venv_failed(format!(
                "interpreter missing at {}",
                env.interpreter().display()
            )));
        }
        tracing::debug!(
            execution_id = %env.id(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Virtual environment ready"
        );

        for dependency in dependencies {
            let install_failed = |reason: String| ProvisionError::DependencyInstall {
                dependency: dependency.clone(),
                reason,
            };

            validate_dependency(dependency)
                .map_err(|e| install_failed(e.to_string()))?;

            tracing::info!(
                execution_id = %env.id(),
                dependency = %dependency,
                "Installing dependency"
            );

            let mut pip = Command::new(env.interpreter());
            pip.args([
                "-m",
                "pip",
                "install",
                "--isolated",
                "--no-cache-dir",
                "--disable-pip-version-check",
                "--no-input",
                "--",
            ])
            .arg(dependency);

            let result = run_tool(env, pip).await.map_err(install_failed)?;
            if !result.success {
                tracing::warn!(
                    execution_id = %env.id(),
                    dependency = %dependency,
                    "Dependency install failed"
                );
                return Err(install_failed(tail(&result.stderr, STDERR_TAIL_CHARS)));
            }
        }

        Ok(())
    }
}

struct ToolResult {
    success: bool,
    stderr: String,
}

/// Run a provisioning tool in its own process group, registered with `env`
/// so teardown can kill it if this future is dropped.
async fn run_tool(env: &Environment, mut command: Command) -> Result<ToolResult, String> {
    command
        .current_dir(env.root())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let child = command.spawn().map_err(|e| format!("failed to spawn: {}", e))?;
    let pgid = child.id();
    if let Some(pgid) = pgid {
        env.track_process_group(pgid);
    }

    let output = child.wait_with_output().await;

    if let Some(pgid) = pgid {
        super::environment::kill_process_group(pgid);
        env.untrack_process_group(pgid);
    }

    let output = output.map_err(|e| format!("failed to wait: {}", e))?;
    Ok(ToolResult {
        success: output.status.success(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
