//! Guest process supervision
//!
//! Runs `<venv python> -I -B -c <code>` inside a provisioned environment under
//! the engine's [`Confinement`], races it against the wall-clock deadline and
//! caller cancellation, and captures both output streams concurrently.

use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::environment::{kill_process_group, Environment};
use super::output::OutputCapture;
use super::policy::{hook_failure, Confinement};
use crate::types::{ExecutionOutcome, SandboxStrength};

/// Launches guest code and turns whatever happens into an [`ExecutionOutcome`]
#[derive(Debug, Clone)]
pub struct Supervisor {
    confinement: Confinement,
}

enum Interrupt {
    TimedOut,
    Cancelled,
}

impl Supervisor {
    pub fn new(confinement: Confinement) -> Self {
        Self { confinement }
    }

    pub fn confinement(&self) -> &Confinement {
        &self.confinement
    }

    pub fn strength(&self) -> SandboxStrength {
        self.confinement.strength()
    }

    /// Run `code` in `env`.
    ///
    /// The deadline starts at spawn. On expiry or cancellation the whole
    /// process group is killed before returning. Never panics and never waits
    /// past the deadline.
    pub async fn execute(
        &self,
        env: &Environment,
        code: &str,
        timeout: Duration,
        max_output_bytes: usize,
        cancel: &CancellationToken,
    ) -> ExecutionOutcome {
        let mut command = guest_command(env, code);

        if let Err(e) = self.confinement.apply(&mut command) {
            tracing::error!(execution_id = %env.id(), "Failed to attach syscall policy: {}", e);
            return ExecutionOutcome::PolicyFailed {
                cause: e.to_string(),
            };
        }

        let start = Instant::now();
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                if let Some(policy_error) = hook_failure(&e) {
                    tracing::error!(execution_id = %env.id(), "{}", policy_error);
                    return ExecutionOutcome::PolicyFailed {
                        cause: policy_error.to_string(),
                    };
                }
                tracing::error!(execution_id = %env.id(), "Failed to spawn interpreter: {}", e);
                return ExecutionOutcome::RuntimeFailure {
                    cause: format!(
                        "Failed to spawn interpreter '{}': {}",
                        env.interpreter().display(),
                        e
                    ),
                };
            }
        };

        let pgid = child.id();
        if let Some(pgid) = pgid {
            env.track_process_group(pgid);
        }
        tracing::debug!(execution_id = %env.id(), pid = ?pgid, "Guest process spawned");

        let mut child_stdout = child.stdout.take();
        let mut child_stderr = child.stderr.take();
        let capture = OutputCapture::new(max_output_bytes);

        let finished = {
            let run = async {
                let wait = async {
                    let status = child.wait().await;
                    // Backgrounded grandchildren would otherwise keep the pipes open.
                    if let Some(pgid) = pgid {
                        kill_process_group(pgid);
                    }
                    status
                };
                tokio::join!(
                    wait,
                    capture.capture_opt(child_stdout.as_mut()),
                    capture.capture_opt(child_stderr.as_mut())
                )
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Interrupt::Cancelled),
                _ = tokio::time::sleep(timeout) => Err(Interrupt::TimedOut),
                result = run => Ok(result),
            }
        };

        let elapsed = start.elapsed();

        let outcome = match finished {
            Ok((Ok(status), stdout, stderr)) => {
                let (exit_code, signal) = exit_details(status);

                if stdout.truncated {
                    tracing::warn!(
                        execution_id = %env.id(),
                        "stdout truncated at {} of {} bytes",
                        max_output_bytes,
                        stdout.total_bytes
                    );
                }
                if stderr.truncated {
                    tracing::warn!(
                        execution_id = %env.id(),
                        "stderr truncated at {} of {} bytes",
                        max_output_bytes,
                        stderr.total_bytes
                    );
                }
                if is_policy_violation(signal) {
                    tracing::warn!(
                        execution_id = %env.id(),
                        "Guest killed for a syscall policy violation"
                    );
                }

                tracing::debug!(
                    execution_id = %env.id(),
                    exit_code,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Guest process exited"
                );

                ExecutionOutcome::Completed {
                    stdout,
                    stderr,
                    exit_code,
                    signal,
                    elapsed,
                }
            }
            Ok((Err(e), _, _)) => {
                tracing::error!(execution_id = %env.id(), "Failed to wait on guest process: {}", e);
                terminate(&mut child, pgid).await;
                ExecutionOutcome::RuntimeFailure {
                    cause: format!("Failed to wait on interpreter: {}", e),
                }
            }
            Err(Interrupt::TimedOut) => {
                tracing::warn!(
                    execution_id = %env.id(),
                    "Wall-clock timeout ({:?}) exceeded, killing guest",
                    timeout
                );
                terminate(&mut child, pgid).await;
                ExecutionOutcome::TimedOut { elapsed, timeout }
            }
            Err(Interrupt::Cancelled) => {
                tracing::info!(execution_id = %env.id(), "Execution cancelled, killing guest");
                terminate(&mut child, pgid).await;
                ExecutionOutcome::Cancelled { elapsed }
            }
        };

        if let Some(pgid) = pgid {
            env.untrack_process_group(pgid);
        }

        outcome
    }
}

/// Command for running `code` with the environment's own interpreter.
///
/// The code travels as an argument, never through a file, and the guest sees
/// a cleared environment. The session and process group are set up by
/// [`Confinement::apply`].
pub fn guest_command(env: &Environment, code: &str) -> Command {
    let search_path = std::env::join_paths([
        env.bin_dir(),
        "/usr/bin".into(),
        "/bin".into(),
    ])
    .unwrap_or_else(|_| env.bin_dir().into_os_string());

    let mut command = Command::new(env.interpreter());
    command
        .arg("-I")
        .arg("-B")
        .arg("-c")
        .arg(code)
        .current_dir(env.work_dir())
        .env_clear()
        .env("PATH", search_path)
        .env("HOME", env.work_dir())
        .env("VIRTUAL_ENV", env.venv_dir())
        .env("PYTHONIOENCODING", "utf-8")
        .env("PYTHONDONTWRITEBYTECODE", "1")
        .env("LANG", "C.UTF-8")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(windows)]
    if let Some(system_root) = std::env::var_os("SYSTEMROOT") {
        command.env("SYSTEMROOT", system_root);
    }

    command
}

/// Kill the child's process group and the child itself.
async fn terminate(child: &mut tokio::process::Child, pgid: Option<u32>) {
    if let Some(pgid) = pgid {
        kill_process_group(pgid);
    }
    if let Err(e) = child.kill().await {
        tracing::debug!("Guest already gone: {}", e);
    }
}

/// Exit code plus terminating signal; a signal death reports `128 + signal`.
fn exit_details(status: ExitStatus) -> (i32, Option<i32>) {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return (128 + signal, Some(signal));
        }
    }
    (status.code().unwrap_or(-1), None)
}

#[cfg(unix)]
fn is_policy_violation(signal: Option<i32>) -> bool {
    signal == Some(super::policy::VIOLATION_SIGNAL)
}

#[cfg(not(unix))]
fn is_policy_violation(_signal: Option<i32>) -> bool {
    false
}
