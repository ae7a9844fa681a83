//! End-to-end tests for the execution engine
//!
//! These drive a real `python3`. When no interpreter with the `venv` module is
//! installed they print a notice and return early.

#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ephemera_runtime::{
    to_response, CancellationToken, EngineConfig, ExecutionOutcome, ExecutionReport,
    ExecutionRequest, ExecutionResponse, PolicyMode, SandboxEngine, SandboxStrength,
};

fn python_available() -> bool {
    std::process::Command::new("python3")
        .args(["-c", "import venv"])
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn engine_in(base: &Path, configure: impl FnOnce(&mut EngineConfig)) -> Option<SandboxEngine> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("ephemera_runtime=debug")
        .with_test_writer()
        .try_init();
    if !python_available() {
        eprintln!("Skipping: python3 with venv support not available");
        return None;
    }
    let mut config = EngineConfig::default();
    config.provisioning.base_dir = Some(base.to_path_buf());
    configure(&mut config);
    Some(SandboxEngine::new(config).expect("engine should build"))
}

/// Engine whose "interpreter" is a shell script, for exercising provisioning
/// without a real Python.
fn stub_engine(
    base: &Path,
    script: &str,
    configure: impl FnOnce(&mut EngineConfig),
) -> SandboxEngine {
    use std::os::unix::fs::PermissionsExt;

    let stub = base.join("stub-python");
    let mode = std::fs::Permissions::from_mode(0o755);
    let body = format!("#!/bin/sh\n{}", script);
    std::fs::write(&stub, body).unwrap();
    std::fs::set_permissions(&stub, mode).unwrap();

    let workspaces = base.join("workspaces");
    let mut config = EngineConfig::default();
    config.interpreter.executable = stub.display().to_string();
    config.provisioning.base_dir = Some(workspaces);
    configure(&mut config);
    SandboxEngine::new(config).expect("engine should build")
}

/// A pid counts as gone once it no longer exists or is a zombie.
fn process_running(pid: i32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => !stat.contains(") Z "),
        Err(_) => false,
    }
}

/// Wait briefly for every pid in `pid_file` to exit.
async fn assert_processes_gone(pid_file: &Path) {
    let pids: Vec<i32> = std::fs::read_to_string(pid_file)
        .unwrap_or_default()
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect();
    assert!(!pids.is_empty(), "stub never recorded its pids");

    let deadline = Instant::now() + Duration::from_secs(5);
    while pids.iter().any(|pid| process_running(*pid)) {
        assert!(Instant::now() < deadline, "provisioning processes survived: {:?}", pids);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn assert_empty_dir(dir: &Path) {
    let leftovers: Vec<_> = std::fs::read_dir(dir)
        .map(|entries| entries.filter_map(Result::ok).map(|e| e.path()).collect())
        .unwrap_or_default();
    assert!(leftovers.is_empty(), "left behind: {:?}", leftovers);
}

fn assert_torn_down(report: &ExecutionReport) {
    let workspace = report
        .workspace
        .as_ref()
        .expect("provisioned runs record their workspace");
    assert!(
        !workspace.exists(),
        "workspace {} survived the request",
        workspace.display()
    );
}

fn completed(report: &ExecutionReport) -> (String, String, i32, Option<i32>) {
    match &report.outcome {
        ExecutionOutcome::Completed {
            stdout,
            stderr,
            exit_code,
            signal,
            ..
        } => (
            stdout.to_string_lossy(),
            stderr.to_string_lossy(),
            *exit_code,
            *signal,
        ),
        other => panic!("expected Completed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_prints_result() {
    let base = tempfile::tempdir().unwrap();
    let Some(engine) = engine_in(base.path(), |_| {}) else {
        return;
    };

    let report = engine.run(ExecutionRequest::new("print(6 * 7)")).await;

    let (stdout, stderr, exit_code, signal) = completed(&report);
    assert_eq!(stdout, "42\n");
    assert_eq!(stderr, "");
    assert_eq!(exit_code, 0);
    assert_eq!(signal, None);
    assert_eq!(report.sandbox_strength, engine.sandbox_strength());
    assert_torn_down(&report);
}

#[tokio::test]
async fn test_guest_failure_is_completed_not_error() {
    let base = tempfile::tempdir().unwrap();
    let Some(engine) = engine_in(base.path(), |_| {}) else {
        return;
    };

    let report = engine
        .run(ExecutionRequest::new("import nonexistent_pkg_xyz"))
        .await;

    let (_, stderr, exit_code, _) = completed(&report);
    assert_ne!(exit_code, 0);
    assert!(stderr.contains("No module"), "stderr was: {}", stderr);
    assert!(!to_response(&report).is_error());
    assert_torn_down(&report);
}

#[tokio::test]
async fn test_infinite_loop_times_out() {
    let base = tempfile::tempdir().unwrap();
    let Some(engine) = engine_in(base.path(), |_| {}) else {
        return;
    };

    let request = ExecutionRequest::new("while True: pass")
        .with_timeout_seconds(1)
        .unwrap();
    let report = engine.run(request).await;

    match &report.outcome {
        ExecutionOutcome::TimedOut { elapsed, timeout } => {
            assert_eq!(*timeout, Duration::from_secs(1));
            assert!(*elapsed >= Duration::from_secs(1));
            assert!(*elapsed < Duration::from_secs(3), "took {:?}", elapsed);
        }
        other => panic!("expected TimedOut, got {:?}", other),
    }

    match to_response(&report) {
        ExecutionResponse::Error { error, .. } => {
            assert_eq!(error, "Timeout (1s) exceeded during code execution.")
        }
        other => panic!("expected error response, got {:?}", other),
    }
    assert_torn_down(&report);
}

#[tokio::test]
async fn test_output_is_head_truncated() {
    let base = tempfile::tempdir().unwrap();
    let Some(engine) = engine_in(base.path(), |_| {}) else {
        return;
    };

    let request = ExecutionRequest::new("print('x' * 20000)")
        .with_max_output_bytes(10)
        .unwrap();
    let report = engine.run(request).await;

    match &report.outcome {
        ExecutionOutcome::Completed { stdout, stderr, .. } => {
            assert_eq!(stdout.bytes, b"xxxxxxxxxx");
            assert!(stdout.truncated);
            assert_eq!(stdout.total_bytes, 20001);
            assert!(!stderr.truncated);
        }
        other => panic!("expected Completed, got {:?}", other),
    }
    assert_torn_down(&report);
}

#[tokio::test]
async fn test_empty_dependencies_skip_installer() {
    let base = tempfile::tempdir().unwrap();
    let Some(engine) = engine_in(base.path(), |_| {}) else {
        return;
    };

    let report = engine
        .run(ExecutionRequest::new(
            "import importlib.util; print(importlib.util.find_spec('pip') is None)",
        ))
        .await;

    let (stdout, _, exit_code, _) = completed(&report);
    assert_eq!(exit_code, 0);
    assert_eq!(stdout, "True\n");
}

#[tokio::test]
async fn test_failing_dependency_aborts_provisioning() {
    let base = tempfile::tempdir().unwrap();
    let Some(engine) = engine_in(base.path(), |config| {
        config.provisioning.timeout_seconds = 120;
    }) else {
        return;
    };

    let request = ExecutionRequest::new("print('never runs')")
        .with_dependencies(["./missing-package-dir-for-tests", "six"])
        .unwrap();
    let report = engine.run(request).await;

    match &report.outcome {
        ExecutionOutcome::ProvisioningFailed { cause } => {
            // Hosts without ensurepip fail one step earlier, at venv creation.
            if !cause.contains("virtual environment") {
                assert!(
                    cause.starts_with("./missing-package-dir-for-tests:"),
                    "cause was: {}",
                    cause
                );
            }
        }
        other => panic!("expected ProvisioningFailed, got {:?}", other),
    }
    assert_torn_down(&report);
    assert_eq!(std::fs::read_dir(base.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_cancellation_kills_guest() {
    let base = tempfile::tempdir().unwrap();
    let Some(engine) = engine_in(base.path(), |_| {}) else {
        return;
    };

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let report = engine
        .run_with_cancellation(ExecutionRequest::new("import time; time.sleep(60)"), cancel)
        .await;

    assert!(
        matches!(report.outcome, ExecutionOutcome::Cancelled { .. }),
        "got {:?}",
        report.outcome
    );
    assert!(started.elapsed() < Duration::from_secs(30));
    assert_torn_down(&report);
}

#[tokio::test]
async fn test_concurrent_runs_are_isolated() {
    let base = tempfile::tempdir().unwrap();
    let Some(engine) = engine_in(base.path(), |config| {
        config.max_concurrent_executions = 4;
    }) else {
        return;
    };
    let engine = Arc::new(engine);

    let requests: Vec<ExecutionRequest> = (0..6)
        .map(|i| {
            ExecutionRequest::new(format!(
                "import os\nopen('mine-{i}.txt', 'w').write('x')\nprint({i}, sorted(os.listdir('.')))"
            ))
        })
        .collect();

    let reports = engine.run_all(requests).await;

    assert_eq!(reports.len(), 6);
    for (i, report) in reports.iter().enumerate() {
        let (stdout, _, exit_code, _) = completed(report);
        assert_eq!(exit_code, 0);
        assert_eq!(stdout, format!("{} ['mine-{}.txt']\n", i, i));
        assert_torn_down(report);
    }
    assert_eq!(std::fs::read_dir(base.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_network_syscall_kills_guest() {
    let base = tempfile::tempdir().unwrap();
    let Some(engine) = engine_in(base.path(), |_| {}) else {
        return;
    };
    if engine.sandbox_strength() != SandboxStrength::Full {
        eprintln!("Skipping: seccomp not available on this host");
        return;
    }

    let report = engine
        .run(ExecutionRequest::new(
            "import socket\nprint('before', flush=True)\nsocket.socket()\nprint('after')",
        ))
        .await;

    let (stdout, _, exit_code, signal) = completed(&report);
    assert_eq!(stdout, "before\n");
    assert_eq!(signal, Some(libc::SIGSYS));
    assert_eq!(exit_code, 128 + libc::SIGSYS);
    assert_torn_down(&report);
}

#[tokio::test]
async fn test_signalling_another_process_kills_guest() {
    let base = tempfile::tempdir().unwrap();
    let Some(engine) = engine_in(base.path(), |_| {}) else {
        return;
    };
    if engine.sandbox_strength() != SandboxStrength::Full {
        eprintln!("Skipping: seccomp not available on this host");
        return;
    }

    let mut bystander = std::process::Command::new("sleep")
        .arg("60")
        .spawn()
        .unwrap();
    let report = engine
        .run(ExecutionRequest::new(format!(
            "import os\nprint('before', flush=True)\nos.kill({}, 9)\nprint('after')",
            bystander.id()
        )))
        .await;

    let still_running = bystander.try_wait().unwrap().is_none();
    let _ = bystander.kill();
    let _ = bystander.wait();

    let (stdout, _, exit_code, signal) = completed(&report);
    assert_eq!(stdout, "before\n");
    assert_eq!(signal, Some(libc::SIGSYS));
    assert_eq!(exit_code, 128 + libc::SIGSYS);
    assert!(still_running, "guest killed a process outside its sandbox");
    assert_torn_down(&report);
}

#[tokio::test]
async fn test_signalling_parent_or_group_kills_guest() {
    let base = tempfile::tempdir().unwrap();
    let Some(engine) = engine_in(base.path(), |_| {}) else {
        return;
    };
    if engine.sandbox_strength() != SandboxStrength::Full {
        eprintln!("Skipping: seccomp not available on this host");
        return;
    }

    // Signal 0 only checks permission, so a broken filter harms nothing here.
    for target in ["os.getppid()", "0", "-1"] {
        let report = engine
            .run(ExecutionRequest::new(format!("import os\nos.kill({}, 0)", target)))
            .await;
        let (_, _, _, signal) = completed(&report);
        assert_eq!(signal, Some(libc::SIGSYS), "kill({}, 0) was allowed", target);
    }
}

#[tokio::test]
async fn test_guest_may_signal_itself() {
    let base = tempfile::tempdir().unwrap();
    let Some(engine) = engine_in(base.path(), |_| {}) else {
        return;
    };

    let report = engine
        .run(ExecutionRequest::new(
            "import os, signal\n\
             signal.signal(signal.SIGUSR1, lambda *_: print('handled', flush=True))\n\
             os.kill(os.getpid(), signal.SIGUSR1)\n\
             signal.raise_signal(signal.SIGUSR1)\n\
             print('done')",
        ))
        .await;

    let (stdout, stderr, exit_code, signal) = completed(&report);
    assert_eq!(signal, None, "stderr was: {}", stderr);
    assert_eq!(exit_code, 0);
    assert_eq!(stdout, "handled\nhandled\ndone\n");
}

#[tokio::test]
async fn test_guest_runs_in_its_own_session() {
    let base = tempfile::tempdir().unwrap();
    let Some(engine) = engine_in(base.path(), |config| {
        config.policy.mode = PolicyMode::Disabled;
    }) else {
        return;
    };

    let report = engine
        .run(ExecutionRequest::new(
            "import os\n\
             print(os.getsid(0) == os.getpid())\n\
             try:\n    open('/dev/tty')\nexcept OSError:\n    print('no tty')",
        ))
        .await;

    let (stdout, _, exit_code, _) = completed(&report);
    assert_eq!(exit_code, 0);
    assert_eq!(stdout, "True\nno tty\n");
}

#[tokio::test]
async fn test_minimal_policy_is_too_small_for_cpython() {
    let base = tempfile::tempdir().unwrap();
    let Some(engine) = engine_in(base.path(), |config| {
        config.policy.mode = PolicyMode::Minimal;
    }) else {
        return;
    };
    if engine.sandbox_strength() != SandboxStrength::Full {
        eprintln!("Skipping: seccomp not available on this host");
        return;
    }

    let report = engine.run(ExecutionRequest::new("print(1)")).await;

    let (_, _, _, signal) = completed(&report);
    assert_eq!(signal, Some(libc::SIGSYS));
}

#[tokio::test]
async fn test_background_children_do_not_outlive_request() {
    let base = tempfile::tempdir().unwrap();
    let Some(engine) = engine_in(base.path(), |config| {
        config.policy.mode = PolicyMode::Disabled;
    }) else {
        return;
    };
    assert_eq!(engine.sandbox_strength(), SandboxStrength::None);

    let started = std::time::Instant::now();
    let report = engine
        .run(ExecutionRequest::new(
            "import subprocess\nsubprocess.Popen(['sleep', '60'])\nprint('started')",
        ))
        .await;

    let (stdout, _, exit_code, _) = completed(&report);
    assert_eq!(stdout, "started\n");
    assert_eq!(exit_code, 0);
    assert!(started.elapsed() < Duration::from_secs(30));
    assert_torn_down(&report);
}

#[tokio::test]
async fn test_provisioning_deadline_tears_down() {
    let base = tempfile::tempdir().unwrap();
    let pid_file = base.path().join("pids");
    let engine = stub_engine(
        base.path(),
        &format!(
            "echo $$ >> {pids}\nsleep 60 &\necho $! >> {pids}\nsleep 60\n",
            pids = pid_file.display()
        ),
        |config| config.provisioning.timeout_seconds = 1,
    );

    let started = Instant::now();
    let report = engine.run(ExecutionRequest::new("print(1)")).await;

    match &report.outcome {
        ExecutionOutcome::ProvisioningFailed { cause } => {
            assert!(cause.contains("1s deadline"), "cause was: {}", cause)
        }
        other => panic!("expected ProvisioningFailed, got {:?}", other),
    }
    assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
    assert_torn_down(&report);
    assert_empty_dir(&base.path().join("workspaces"));
    assert_processes_gone(&pid_file).await;
}

#[tokio::test]
async fn test_cancel_during_provisioning_tears_down() {
    let base = tempfile::tempdir().unwrap();
    let pid_file = base.path().join("pids");
    let engine = stub_engine(
        base.path(),
        &format!(
            "echo $$ >> {pids}\nsleep 60 &\necho $! >> {pids}\nsleep 60\n",
            pids = pid_file.display()
        ),
        |config| config.provisioning.timeout_seconds = 120,
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let watched = pid_file.clone();
    tokio::spawn(async move {
        // fire once the stub is demonstrably running
        while !watched.exists() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let report = engine
        .run_with_cancellation(ExecutionRequest::new("print(1)"), cancel)
        .await;

    assert!(
        matches!(report.outcome, ExecutionOutcome::Cancelled { .. }),
        "got {:?}",
        report.outcome
    );
    assert!(started.elapsed() < Duration::from_secs(10), "took {:?}", started.elapsed());
    assert_torn_down(&report);
    assert_empty_dir(&base.path().join("workspaces"));
    assert_processes_gone(&pid_file).await;
}

#[tokio::test]
async fn test_installs_real_dependency() {
    if std::env::var("EPHEMERA_NETWORK_TESTS").is_err() {
        eprintln!("Skipping: set EPHEMERA_NETWORK_TESTS to run tests that reach the package index");
        return;
    }
    let base = tempfile::tempdir().unwrap();
    let Some(engine) = engine_in(base.path(), |_| {}) else {
        return;
    };

    let report = engine
        .run_code("import six; print(six.__name__)", ["six"])
        .await
        .unwrap();

    let (stdout, _, exit_code, _) = completed(&report);
    assert_eq!(exit_code, 0);
    assert_eq!(stdout, "six\n");
    assert_torn_down(&report);
}

#[tokio::test]
async fn test_concurrent_conflicting_versions_stay_separate() {
    if std::env::var("EPHEMERA_NETWORK_TESTS").is_err() {
        eprintln!("Skipping: set EPHEMERA_NETWORK_TESTS to run tests that reach the package index");
        return;
    }
    let base = tempfile::tempdir().unwrap();
    let Some(engine) = engine_in(base.path(), |config| {
        config.max_concurrent_executions = 2;
    }) else {
        return;
    };
    let engine = Arc::new(engine);

    let versions = ["1.15.0", "1.16.0"];
    let requests: Vec<ExecutionRequest> = versions
        .iter()
        .map(|version| {
            ExecutionRequest::new("import six; print(six.__version__)")
                .with_dependencies([format!("six=={}", version)])
                .unwrap()
                .with_timeout_seconds(60)
                .unwrap()
        })
        .collect();

    let reports = engine.run_all(requests).await;

    for (version, report) in versions.iter().zip(&reports) {
        let (stdout, stderr, exit_code, _) = completed(report);
        assert_eq!(exit_code, 0, "stderr was: {}", stderr);
        assert_eq!(stdout, format!("{}\n", version));
        assert_torn_down(report);
    }
    assert_eq!(std::fs::read_dir(base.path()).unwrap().count(), 0);
}
