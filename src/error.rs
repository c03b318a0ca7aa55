//! Error taxonomy for the execution pipeline.
//!
//! Every variant ends up as a failed [`ExecutionResult`](crate::types::ExecutionResult)
//! at the orchestrator boundary; none of them reach callers as `Err`.

use std::time::Duration;

use thiserror::Error;

use crate::types::ErrorKind;

/// Failure raised while staging, compiling or running a submission.
#[derive(Debug, Error)]
pub enum ExecError {
    /// Scratch workspace could not be created or written.
    #[error("Failed to prepare workspace: {0}")]
    Staging(#[source] std::io::Error),

    /// The compiler rejected the source. Carries its diagnostics verbatim.
    #[error("Compilation error: {0}")]
    Compilation(String),

    /// The program exited non-zero or crashed. `output` is whatever it
    /// wrote to stdout before that.
    #[error("Runtime error: {message}")]
    Runtime {
        message: String,
        output: String,
        runtime: Duration,
    },

    /// A compile or run step exceeded its wall-clock limit and was killed.
    #[error("Execution timed out after {} seconds", .limit.as_secs())]
    Timeout { limit: Duration, elapsed: Duration },

    /// The container runtime cannot be reached at all.
    #[error("Sandbox unavailable: {0}")]
    SandboxUnavailable(String),

    #[error("Execution error: {0}")]
    Unexpected(String),
}

impl ExecError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Staging(_) => ErrorKind::Staging,
            Self::Compilation(_) => ErrorKind::Compilation,
            Self::Runtime { .. } => ErrorKind::Runtime,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::SandboxUnavailable(_) => ErrorKind::SandboxUnavailable,
            Self::Unexpected(_) => ErrorKind::Unexpected,
        }
    }

    /// Measured execution time, for errors raised after the program started.
    pub const fn runtime(&self) -> Option<Duration> {
        match self {
            Self::Runtime { runtime, .. } => Some(*runtime),
            Self::Timeout { elapsed, .. } => Some(*elapsed),
            _ => None,
        }
    }

    /// Stdout the program produced before failing, if any.
    pub fn partial_output(&self) -> Option<&str> {
        match self {
            Self::Runtime { output, .. } if !output.trim().is_empty() => Some(output),
            _ => None,
        }
    }

    /// Whether the failure is infrastructural and warrants the fallback path.
    pub const fn is_unavailable(&self) -> bool {
        matches!(self, Self::SandboxUnavailable(_))
    }
}
