//! MCP server implementation using rmcp.
//!
//! Exposes the orchestrator as a single `execute` tool over stdio.

use std::sync::Arc;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo};
use rmcp::schemars;
use rmcp::transport::stdio;
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt};
use schemars::JsonSchema;
use serde::Deserialize;
use tracing::info;

use crate::orchestrator::Orchestrator;
use crate::types::{ExecutionRequest, Language};

/// MCP server for sandboxed code execution.
#[derive(Clone)]
pub struct RunnerServer {
    orchestrator: Arc<Orchestrator>,
    tool_router: ToolRouter<Self>,
}

/// Parameters for the execute tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecuteParams {
    /// The source code to run.
    #[schemars(description = "The source code to run")]
    pub code: String,

    /// Source language; omitted means Python.
    #[schemars(description = "Source language: 'python' (default), 'c' or 'cpp'")]
    #[serde(default)]
    pub language: Option<String>,
}

#[tool_router]
impl RunnerServer {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            tool_router: Self::tool_router(),
        }
    }

    /// Run code in the sandbox, falling back to local execution.
    #[tool(description = "Compile and run Python, C or C++ code in an isolated container")]
    async fn execute(
        &self,
        Parameters(params): Parameters<ExecuteParams>,
    ) -> Result<CallToolResult, McpError> {
        let request = Language::from_optional(params.language.as_deref())
            .and_then(|language| ExecutionRequest::new(params.code, language))
            .map_err(|e| McpError::invalid_params(e.to_string(), None))?;

        info!(language = %request.language(), code_len = request.source_code().len(), "Executing code");

        let result = self.orchestrator.execute(&request).await;
        let text = format!(
            "{}\n--- {} backend, {:.1} ms ---",
            result.display_text(),
            result.backend,
            result.runtime_ms
        );

        if result.success {
            Ok(CallToolResult::success(vec![Content::text(text)]))
        } else {
            Ok(CallToolResult::error(vec![Content::text(text)]))
        }
    }
}

#[tool_handler]
impl ServerHandler for RunnerServer {
    fn get_info(&self) -> ServerInfo {
        let backend = if self.orchestrator.has_sandbox() {
            "Docker containers (local fallback when Docker is unreachable)"
        } else {
            "local processes"
        };

        ServerInfo {
            protocol_version: rmcp::model::ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "algo-runner".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(format!(
                "Run Python, C or C++ programs and get their output and runtime.\n\
                 Code runs in {backend}.\n\
                 \n\
                 Use the 'execute' tool with:\n\
                 - code: the program source\n\
                 - language: 'python' (default), 'c' or 'cpp'"
            )),
        }
    }
}

/// Serve the runner over stdio.
pub async fn serve_stdio(orchestrator: Arc<Orchestrator>) -> anyhow::Result<()> {
    let server = RunnerServer::new(orchestrator);

    info!("Starting MCP server on stdio");

    let service = server
        .serve(stdio())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start MCP server: {e}"))?;

    service
        .waiting()
        .await
        .map_err(|e| anyhow::anyhow!("MCP server error: {e}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{IsolationBackend, RunOutput};
    use crate::error::ExecError;
    use crate::types::BackendKind;
    use crate::workspace::{ScratchWorkspace, Stager};
    use async_trait::async_trait;
    use std::time::Duration;

    struct MockBackend;

    #[async_trait]
    impl IsolationBackend for MockBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Sandbox
        }

        async fn execute(&self, workspace: &ScratchWorkspace) -> Result<RunOutput, ExecError> {
            if workspace.language() == Language::Cpp {
                return Err(ExecError::Compilation("expected ';'".into()));
            }
            Ok(RunOutput {
                stdout: "executed\n".into(),
                stderr: String::new(),
                runtime: Duration::from_millis(3),
            })
        }
    }

    fn server(root: &std::path::Path) -> RunnerServer {
        let orchestrator = Orchestrator::new(
            Stager::new(root),
            Some(Arc::new(MockBackend)),
            Arc::new(MockBackend),
            1024,
        );
        RunnerServer::new(Arc::new(orchestrator))
    }

    fn params(code: &str, language: Option<&str>) -> Parameters<ExecuteParams> {
        Parameters(ExecuteParams {
            code: code.to_string(),
            language: language.map(String::from),
        })
    }

    #[tokio::test]
    async fn test_execute_success() {
        let root = tempfile::tempdir().unwrap();
        let result = server(root.path())
            .execute(params("print(1)", None))
            .await
            .unwrap();
        assert!(!result.is_error.unwrap_or(false));
    }

    #[tokio::test]
    async fn test_execute_program_error() {
        let root = tempfile::tempdir().unwrap();
        let result = server(root.path())
            .execute(params("int main( {", Some("cpp")))
            .await
            .unwrap();
        assert!(result.is_error.unwrap_or(false));
    }

    #[tokio::test]
    async fn test_execute_rejects_empty_code() {
        let root = tempfile::tempdir().unwrap();
        let result = server(root.path()).execute(params("  ", None)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_execute_rejects_unknown_language() {
        let root = tempfile::tempdir().unwrap();
        let result = server(root.path())
            .execute(params("x", Some("fortran")))
            .await;
        assert!(result.is_err());
    }
}
