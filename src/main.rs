//! Ephemera command-line interface
//!
//! `run` executes a single snippet and prints the JSON response, `mcp` serves
//! the engine to MCP clients over stdio, and `doctor` reports how strongly
//! this host can isolate guest code.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ephemera_runtime::{EngineConfig, LogFormat};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod commands;
mod mcp_server;

#[derive(Parser)]
#[command(name = "ephemera")]
#[command(about = "Run untrusted Python code in a disposable, syscall-filtered environment")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML); EPHEMERA_* variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level written to stderr
    #[arg(long, global = true, value_enum)]
    log_level: Option<LogLevel>,

    /// Shorthand for --log-level debug
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a snippet once and print the JSON result
    Run(commands::run::RunArgs),
    /// Serve the run_python_code tool over MCP stdio
    Mcp,
    /// Check interpreter, virtualenv and seccomp support on this host
    Doctor,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = EngineConfig::load(cli.config.as_deref()).with_context(|| match &cli.config {
        Some(path) => format!("Failed to load configuration from {}", path.display()),
        None => "Failed to load configuration from the environment".to_string(),
    })?;

    let level = if cli.verbose {
        "debug"
    } else {
        cli.log_level
            .map(LogLevel::as_str)
            .unwrap_or(config.logging.level.as_str())
    };
    init_tracing(level, config.logging.format)?;

    match cli.command {
        Commands::Run(args) => commands::run::run(config, args).await,
        Commands::Mcp => {
            mcp_server::start_mcp_server(config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Doctor => commands::doctor::run(config).await,
    }
}

/// Install the global subscriber. Output goes to stderr; stdout carries
/// results and the MCP transport.
fn init_tracing(level: &str, format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("Invalid log level '{}'", level))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Compact => builder.compact().init(),
    }

    Ok(())
}
