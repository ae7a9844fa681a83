use anyhow::Result;
use ephemera_runtime::{Capabilities, EngineConfig, SandboxEngine, SandboxStrength};
use std::process::ExitCode;
use tokio::process::Command;

/// Report what this host can do for guest code. Exits 1 when requests could
/// not run at all.
pub async fn run(config: EngineConfig) -> Result<ExitCode> {
    println!("🔍 Checking execution host...\n");

    let python = config.interpreter.executable.clone();
    let mut all_ok = true;

    print!("• Checking interpreter... ");
    match run_check(&python, &["--version"]).await {
        Some(version) => println!("✓ {} ({})", python, version),
        None => {
            println!("✗ '{}' not found or not runnable", python);
            println!("  Set interpreter.executable or EPHEMERA_PYTHON");
            all_ok = false;
        }
    }

    print!("• Checking venv module... ");
    if run_check(&python, &["-c", "import venv"]).await.is_some() {
        println!("✓ Available");
    } else {
        println!("✗ Missing (Debian/Ubuntu: apt install python3-venv)");
        all_ok = false;
    }

    print!("• Checking ensurepip (needed for extra libraries)... ");
    if run_check(&python, &["-c", "import ensurepip"]).await.is_some() {
        println!("✓ Available");
    } else {
        println!("○ Missing; requests without dependencies still work");
    }

    let capabilities = Capabilities::detect();
    print!("• Checking seccomp... ");
    if capabilities.seccomp {
        println!("✓ Supported on {}/{}", capabilities.os, capabilities.arch);
    } else {
        println!(
            "⚠️  Not available on {}/{}",
            capabilities.os, capabilities.arch
        );
    }

    print!("• Checking syscall policy... ");
    let mode = config.policy.mode;
    match SandboxEngine::new(config) {
        Ok(engine) => {
            println!(
                "✓ {} mode, {} syscalls allowed",
                mode,
                engine.policy().allowed().len()
            );
            println!();
            match engine.sandbox_strength() {
                SandboxStrength::Full => println!("Sandbox strength: full"),
                SandboxStrength::None => {
                    println!("⚠️  Sandbox strength: none (guest code runs unfiltered)")
                }
            }
        }
        Err(e) => {
            println!("✗ {}", e);
            all_ok = false;
        }
    }

    println!();
    if all_ok {
        println!("✅ Ready to run: ephemera run --code 'print(1)'");
        Ok(ExitCode::SUCCESS)
    } else {
        println!("⚠️  Some checks failed. Fix the issues above before running code");
        Ok(ExitCode::FAILURE)
    }
}

/// Trimmed output of a successful `python <args>`, or `None`.
async fn run_check(python: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(python).args(args).output().await.ok()?;
    if !output.status.success() {
        return None;
    }
    // Python 2 printed --version to stderr.
    let text = if output.stdout.is_empty() {
        output.stderr
    } else {
        output.stdout
    };
    Some(String::from_utf8_lossy(&text).trim().to_string())
}
