//! MCP server for the execution engine.
//!
//! Exposes `run_python_code` over stdio using the rmcp SDK, so MCP clients can
//! hand untrusted snippets to a disposable sandbox, plus `sandbox_info` for
//! checking how strongly this host isolates them.

use std::sync::Arc;

use anyhow::Context as _;
use ephemera_runtime::{to_response, EngineConfig, EngineError, ExecutionRequest, SandboxEngine};
use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::*,
    service::RequestContext,
    tool, tool_handler, tool_router,
    transport::stdio,
    ErrorData as McpError, RoleServer, ServerHandler, ServiceExt,
};
use schemars::JsonSchema;
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Parameter structs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RunPythonCodeParams {
    /// Python source to execute
    pub code: String,
    /// Packages to pip-install into the throwaway environment first
    #[serde(default)]
    pub extra_libraries: Vec<String>,
    /// Wall-clock limit in seconds (server default when omitted)
    pub timeout_seconds: Option<u64>,
    /// Per-stream output cap in bytes (server default when omitted)
    pub max_output_bytes: Option<usize>,
}

// ---------------------------------------------------------------------------
// Server struct
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct EphemeraMcpServer {
    engine: Arc<SandboxEngine>,
    tool_router: ToolRouter<Self>,
}

// ---------------------------------------------------------------------------
// Tool definitions
// ---------------------------------------------------------------------------

#[tool_router]
impl EphemeraMcpServer {
    pub fn new(engine: Arc<SandboxEngine>) -> Self {
        Self {
            engine,
            tool_router: Self::tool_router(),
        }
    }

    #[tool(
        description = "Run Python code once in a fresh, isolated virtual environment and return its output as JSON. Optional extra_libraries are pip-installed first. The environment is destroyed afterwards. Call sandbox_info to see how strongly this host confines the program."
    )]
    async fn run_python_code(
        &self,
        Parameters(params): Parameters<RunPythonCodeParams>,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let request = match request_from_params(&self.engine, params) {
            Ok(request) => request,
            Err(e) => {
                return Ok(CallToolResult::error(vec![Content::text(e.to_string())]));
            }
        };

        // The client cancelling the call kills the guest and tears down its environment.
        let report = self
            .engine
            .run_with_cancellation(request, context.ct.child_token())
            .await;
        let response = to_response(&report);

        let json = serde_json::to_string_pretty(&response).map_err(|e| {
            McpError::internal_error(format!("Failed to encode response: {}", e), None)
        })?;

        if response.is_error() {
            Ok(CallToolResult::error(vec![Content::text(json)]))
        } else {
            Ok(CallToolResult::success(vec![Content::text(json)]))
        }
    }

    #[tool(
        description = "Describe this execution host: sandbox strength, syscall policy mode, interpreter and default limits."
    )]
    async fn sandbox_info(&self) -> Result<CallToolResult, McpError> {
        let config = self.engine.config();
        let capabilities = self.engine.capabilities();

        let info = serde_json::json!({
            "sandbox": self.engine.sandbox_strength(),
            "policy_mode": self.engine.policy().mode(),
            "allowed_syscalls": self.engine.policy().allowed().len(),
            "self_only_syscalls": self.engine.policy().self_signal(),
            "os": capabilities.os,
            "arch": capabilities.arch,
            "interpreter": config.interpreter.executable,
            "default_timeout_seconds": config.execution.timeout_seconds,
            "default_max_output_bytes": config.execution.max_output_bytes,
            "max_concurrent_executions": config.max_concurrent_executions,
        });

        let json = serde_json::to_string_pretty(&info).unwrap_or_else(|_| "{}".to_string());
        Ok(CallToolResult::success(vec![Content::text(json)]))
    }
}

/// Server defaults, overridden by whatever the caller supplied.
fn request_from_params(
    engine: &SandboxEngine,
    params: RunPythonCodeParams,
) -> Result<ExecutionRequest, EngineError> {
    let mut request = engine
        .request(params.code)?
        .with_dependencies(params.extra_libraries)?;
    if let Some(seconds) = params.timeout_seconds {
        request = request.with_timeout_seconds(seconds)?;
    }
    if let Some(bytes) = params.max_output_bytes {
        request = request.with_max_output_bytes(bytes)?;
    }
    Ok(request)
}

// ---------------------------------------------------------------------------
// ServerHandler: #[tool_handler] generates list_tools and call_tool
// ---------------------------------------------------------------------------

#[tool_handler]
impl ServerHandler for EphemeraMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Ephemera runs untrusted Python snippets in disposable, syscall-filtered \
                 virtual environments. Use run_python_code; guest failures come back as \
                 status=completed with a non-zero exit_code."
                    .to_string(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Start the MCP server over stdio transport.
///
/// Logging must already be directed to stderr; stdout is the transport.
pub async fn start_mcp_server(config: EngineConfig) -> anyhow::Result<()> {
    let engine = SandboxEngine::new(config).context("Failed to start execution engine")?;
    tracing::info!(
        sandbox = %engine.sandbox_strength(),
        "Serving run_python_code over MCP stdio"
    );

    let service = EphemeraMcpServer::new(Arc::new(engine))
        .serve(stdio())
        .await
        .context("Failed to start MCP transport")?;
    service.waiting().await?;
    Ok(())
}
