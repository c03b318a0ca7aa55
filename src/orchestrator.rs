//! Execution orchestrator.
//!
//! Single entry point for running a submission: stages the source, picks the
//! sandbox or the local fallback, and folds every outcome (including panics)
//! into exactly one [`ExecutionResult`]. The workspace is released before
//! `execute` returns on every path.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use tracing::{error, info, warn};

use crate::backend::{IsolationBackend, RunOutput};
use crate::error::ExecError;
use crate::types::{BackendKind, ExecutionRequest, ExecutionResult};
use crate::workspace::{ScratchWorkspace, Stager};

/// Chooses a backend for each request and normalizes its result.
pub struct Orchestrator {
    stager: Stager,
    sandbox: Option<Arc<dyn IsolationBackend>>,
    fallback: Arc<dyn IsolationBackend>,
    max_output_bytes: usize,
}

impl Orchestrator {
    /// `sandbox` is `None` when container execution is disabled or could not
    /// be set up; requests then go straight to `fallback`.
    pub fn new(
        stager: Stager,
        sandbox: Option<Arc<dyn IsolationBackend>>,
        fallback: Arc<dyn IsolationBackend>,
        max_output_bytes: usize,
    ) -> Self {
        Self {
            stager,
            sandbox,
            fallback,
            max_output_bytes,
        }
    }

    pub const fn has_sandbox(&self) -> bool {
        self.sandbox.is_some()
    }

    /// Whether a sandbox is configured and currently reachable.
    pub async fn sandbox_available(&self) -> bool {
        match &self.sandbox {
            Some(sandbox) => sandbox.is_available().await,
            None => false,
        }
    }

    /// Run one request. Never fails and never panics outward.
    pub async fn execute(&self, request: &ExecutionRequest) -> ExecutionResult {
        let started = Instant::now();
        let first_choice = self.first_choice();

        let workspace = match self
            .stager
            .stage(request.source_code(), request.language())
        {
            Ok(ws) => ws,
            Err(e) => {
                error!(error = %e, "Staging failed");
                return self.failed(&e, started.elapsed(), first_choice);
            }
        };

        let outcome = AssertUnwindSafe(self.dispatch(&workspace))
            .catch_unwind()
            .await;

        let workspace_path = workspace.path().to_path_buf();
        if let Err(e) = workspace.close() {
            warn!(workspace = %workspace_path.display(), error = %e, "Failed to remove workspace");
        }

        let result = match outcome {
            Ok((backend, Ok(output))) => ExecutionResult::success(
                &output.stdout,
                output.runtime,
                backend,
                self.max_output_bytes,
            ),
            Ok((backend, Err(e))) => self.failed(&e, started.elapsed(), backend),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(%message, "Backend panicked");
                self.failed(&ExecError::Unexpected(message), started.elapsed(), first_choice)
            }
        };

        info!(
            language = %request.language(),
            backend = %result.backend,
            success = result.success,
            runtime_ms = result.runtime_ms,
            "Execution finished"
        );
        result
    }

    /// The one decision point between sandbox and fallback.
    ///
    /// Only unavailability of the sandbox leads to the fallback, and only
    /// once. Program errors from the sandbox are final.
    async fn dispatch(
        &self,
        workspace: &ScratchWorkspace,
    ) -> (BackendKind, Result<RunOutput, ExecError>) {
        let Some(sandbox) = &self.sandbox else {
            return (self.fallback.kind(), self.fallback.execute(workspace).await);
        };

        match sandbox.execute(workspace).await {
            Err(e) if e.is_unavailable() => {
                warn!(error = %e, "Sandbox unavailable, falling back to local execution");
                (self.fallback.kind(), self.fallback.execute(workspace).await)
            }
            outcome => (sandbox.kind(), outcome),
        }
    }

    fn first_choice(&self) -> BackendKind {
        self.sandbox
            .as_ref()
            .map_or_else(|| self.fallback.kind(), |s| s.kind())
    }

    fn failed(&self, error: &ExecError, elapsed: Duration, backend: BackendKind) -> ExecutionResult {
        ExecutionResult::failure(error, elapsed, backend, self.max_output_bytes)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "backend panicked".to_string())
}
