use anyhow::{bail, Context, Result};
use clap::Args;
use ephemera_runtime::{
    to_response, CancellationToken, EngineConfig, ExecutionRequest, SandboxEngine,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::io::AsyncReadExt;

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Python source to execute
    #[arg(long, conflicts_with = "file")]
    pub code: Option<String>,

    /// Read the Python source from a file (stdin when neither is given)
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Extra package to install before running; repeatable
    #[arg(short, long = "dep", value_name = "PACKAGE")]
    pub deps: Vec<String>,

    /// Wall-clock limit for the guest, in seconds
    #[arg(short, long, value_name = "SECONDS")]
    pub timeout: Option<u64>,

    /// Per-stream output cap, in bytes
    #[arg(long, value_name = "BYTES")]
    pub max_output: Option<usize>,

    /// Indent the JSON response
    #[arg(long)]
    pub pretty: bool,
}

/// Execute one snippet and print its response. Exits 1 when the engine, not
/// the guest, failed.
pub async fn run(config: EngineConfig, args: RunArgs) -> Result<ExitCode> {
    let code = read_source(&args).await?;
    let engine = SandboxEngine::new(config).context("Failed to start execution engine")?;
    let request = build_request(&engine, code, &args)?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, cancelling execution");
            on_interrupt.cancel();
        }
    });

    let report = engine.run_with_cancellation(request, cancel).await;
    let response = to_response(&report);

    let json = if args.pretty {
        response.to_json_pretty()?
    } else {
        response.to_json()?
    };
    println!("{}", json);

    Ok(if response.is_error() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

async fn read_source(args: &RunArgs) -> Result<String> {
    if let Some(code) = &args.code {
        return Ok(code.clone());
    }

    if let Some(path) = &args.file {
        return tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()));
    }

    let mut code = String::new();
    tokio::io::stdin()
        .read_to_string(&mut code)
        .await
        .context("Failed to read code from stdin")?;
    if code.trim().is_empty() {
        bail!("No code given: pass --code, --file, or pipe source on stdin");
    }
    Ok(code)
}

/// Engine defaults, overridden by whatever the command line supplies.
fn build_request(engine: &SandboxEngine, code: String, args: &RunArgs) -> Result<ExecutionRequest> {
    let mut request = engine
        .request(code)?
        .with_dependencies(args.deps.iter().cloned())?;
    if let Some(seconds) = args.timeout {
        request = request.with_timeout_seconds(seconds)?;
    }
    if let Some(bytes) = args.max_output {
        request = request.with_max_output_bytes(bytes)?;
    }
    Ok(request)
}
