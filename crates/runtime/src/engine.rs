//! The execution engine
//!
//! Ties the pipeline together for each request: provision, attach policy,
//! execute, then tear down on every path. Accepted requests never fail with an
//! error; whatever happens is reported in the [`ExecutionReport`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::EngineConfig;
use crate::sandbox::{
    build_policy, Capabilities, Confinement, Provisioner, Supervisor, SyscallPolicy,
};
use crate::types::{
    EngineError, ExecutionId, ExecutionOutcome, ExecutionReport, ExecutionRequest, ProvisionError,
    SandboxStrength,
};

/// Sandboxed, single-shot code execution
#[derive(Debug)]
pub struct SandboxEngine {
    config: EngineConfig,
    capabilities: Capabilities,
    policy: SyscallPolicy,
    provisioner: Provisioner,
    supervisor: Supervisor,
    permits: Semaphore,
}

impl SandboxEngine {
    /// Validate `config`, detect host capabilities and compile the syscall policy.
    ///
    /// A host without syscall filtering is not an error; the engine logs a
    /// warning and reports [`SandboxStrength::None`] on every result.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;

        let capabilities = Capabilities::detect();
        let policy =
            build_policy(config.policy.mode).with_extra_syscalls(&config.policy.extra_syscalls)?;
        let confinement = Confinement::prepare(&policy, &capabilities, &config.limits)?;

        if confinement.strength() == SandboxStrength::None {
            let reason = if !policy.is_enforcing() {
                "syscall policy disabled by configuration".to_string()
            } else {
                format!(
                    "seccomp filtering unavailable on {}/{}",
                    capabilities.os, capabilities.arch
                )
            };
            tracing::warn!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
            tracing::warn!("Sandbox strength: NONE");
            tracing::warn!("Reason: {}", reason);
            tracing::warn!("Guest code may issue any syscall this user can");
            tracing::warn!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        } else {
            tracing::info!(
                "Sandbox strength: full ({} policy, {} syscalls allowed)",
                policy.mode(),
                policy.allowed().len()
            );
        }

        Ok(Self {
            provisioner: Provisioner::new(&config),
            supervisor: Supervisor::new(confinement),
            permits: Semaphore::new(config.max_concurrent_executions),
            capabilities,
            policy,
            config,
        })
    }

    /// Engine with default configuration overlaid by `EPHEMERA_*` variables
    pub fn from_env() -> Result<Self, EngineError> {
        Self::new(EngineConfig::from_env()?)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn policy(&self) -> &SyscallPolicy {
        &self.policy
    }

    /// Isolation level attached to every report from this engine
    pub fn sandbox_strength(&self) -> SandboxStrength {
        self.supervisor.strength()
    }

    /// A request for `code` using this engine's configured defaults.
    pub fn request(&self, code: impl Into<String>) -> Result<ExecutionRequest, EngineError> {
        Ok(ExecutionRequest::new(code)
            .with_timeout_seconds(self.config.execution.timeout_seconds)?
            .with_max_output_bytes(self.config.execution.max_output_bytes)?)
    }

    /// Run `code` with `dependencies` and the configured defaults.
    pub async fn run_code<I, S>(
        &self,
        code: impl Into<String>,
        dependencies: I,
    ) -> Result<ExecutionReport, EngineError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let request = self.request(code)?.with_dependencies(dependencies)?;
        Ok(self.run(request).await)
    }

    /// Run one request to completion.
    pub async fn run(&self, request: ExecutionRequest) -> ExecutionReport {
        self.run_with_cancellation(request, CancellationToken::new())
            .await
    }

    /// Run one request; cancelling `cancel` kills the guest (or any install
    /// still in progress) and tears the environment down.
    pub async fn run_with_cancellation(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> ExecutionReport {
        let execution_id = ExecutionId::new();
        let span = tracing::info_span!("execution", execution_id = %execution_id);

        self.execute(execution_id, request, cancel)
            .instrument(span)
            .await
    }

    /// Run a batch concurrently, returning reports in input order.
    ///
    /// Each request runs as a child task; the engine's concurrency limit still
    /// applies across the batch.
    pub async fn run_all(
        self: &Arc<Self>,
        requests: Vec<ExecutionRequest>,
    ) -> Vec<ExecutionReport> {
        self.run_all_with_cancellation(requests, CancellationToken::new())
            .await
    }

    /// Like [`run_all`](Self::run_all); cancelling `cancel` cancels every
    /// request in the batch.
    pub async fn run_all_with_cancellation(
        self: &Arc<Self>,
        requests: Vec<ExecutionRequest>,
        cancel: CancellationToken,
    ) -> Vec<ExecutionReport> {
        let count = requests.len();
        let mut tasks = JoinSet::new();

        for (index, request) in requests.into_iter().enumerate() {
            let engine = Arc::clone(self);
            let child_cancel = cancel.child_token();
            tasks.spawn(async move {
                (
                    index,
                    engine.run_with_cancellation(request, child_cancel).await,
                )
            });
        }

        let mut slots: Vec<Option<ExecutionReport>> = (0..count).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, report)) => slots[index] = Some(report),
                Err(e) => tracing::error!("Execution task failed: {}", e),
            }
        }

        slots
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| ExecutionReport {
                    execution_id: ExecutionId::new(),
                    sandbox_strength: self.sandbox_strength(),
                    outcome: ExecutionOutcome::RuntimeFailure {
                        cause: "execution task aborted before reporting".to_string(),
                    },
                    started_at: chrono::Utc::now(),
                    workspace: None,
                })
            })
            .collect()
    }

    async fn execute(
        &self,
        execution_id: ExecutionId,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> ExecutionReport {
        let started_at = chrono::Utc::now();
        let start = Instant::now();
        let report = |outcome: ExecutionOutcome, workspace: Option<PathBuf>| ExecutionReport {
            execution_id,
            sandbox_strength: self.sandbox_strength(),
            outcome,
            started_at,
            workspace,
        };

        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return report(ExecutionOutcome::Cancelled { elapsed: start.elapsed() }, None);
            }
            permit = self.permits.acquire() => match permit {
                Ok(permit) => permit,
                Err(e) => {
                    let cause = format!("engine unavailable: {}", e);
                    return report(ExecutionOutcome::RuntimeFailure { cause }, None);
                }
            },
        };

        tracing::info!(
            dependencies = request.extra_dependencies().len(),
            timeout_seconds = request.timeout_seconds(),
            "Starting execution"
        );

        let mut env = match self.provisioner.create(execution_id) {
            Ok(env) => env,
            Err(e) => {
                tracing::error!("Provisioning failed: {}", e);
                return report(
                    ExecutionOutcome::ProvisioningFailed {
                        cause: e.to_string(),
                    },
                    None,
                );
            }
        };
        let workspace = Some(env.root().to_path_buf());

        let outcome = match self
            .provisioner
            .populate(&env, request.extra_dependencies(), &cancel)
            .await
        {
            Ok(()) => {
                self.supervisor
                    .execute(
                        &env,
                        request.code(),
                        request.timeout(),
                        request.max_output_bytes(),
                        &cancel,
                    )
                    .await
            }
            Err(ProvisionError::Cancelled) => ExecutionOutcome::Cancelled {
                elapsed: start.elapsed(),
            },
            Err(e) => {
                tracing::error!("Provisioning failed: {}", e);
                ExecutionOutcome::ProvisioningFailed {
                    cause: e.to_string(),
                }
            }
        };

        env.release();

        match &outcome {
            ExecutionOutcome::Completed {
                exit_code, elapsed, ..
            } => tracing::info!(
                exit_code,
                elapsed_ms = elapsed.as_millis() as u64,
                "Execution completed"
            ),
            other => tracing::info!(
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Execution ended without completing: {:?}",
                other
            ),
        }

        report(outcome, workspace)
    }
}
