//! Local fallback backend.
//!
//! Runs the compiler and the program as direct child processes confined to
//! the workspace directory. There is no isolation beyond the wall-clock
//! timeouts, so this only runs when the container sandbox is unreachable.
//! Children start from an empty environment: only the variables in
//! [`INHERITED_ENV`] are passed through, so service secrets never reach them.

use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument};

use super::{capture, diagnostics, IsolationBackend, RunOutput, DEFAULT_OUTPUT_LIMIT};
use crate::config::FallbackConfig;
use crate::error::ExecError;
use crate::types::{BackendKind, Language};
use crate::workspace::ScratchWorkspace;

/// Variables copied from the service environment into every child.
pub const INHERITED_ENV: &[&str] = &["PATH", "LANG", "LC_ALL", "TMPDIR"];

/// Backend that runs toolchains installed on the host.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    config: FallbackConfig,
    output_limit: usize,
}

impl LocalBackend {
    #[must_use]
    pub const fn new(config: FallbackConfig) -> Self {
        Self {
            config,
            output_limit: DEFAULT_OUTPUT_LIMIT,
        }
    }

    /// Cap on bytes kept from each output stream.
    #[must_use]
    pub const fn with_output_limit(mut self, output_limit: usize) -> Self {
        self.output_limit = output_limit;
        self
    }

    fn compiler(&self, language: Language) -> Option<&str> {
        match language {
            Language::C => Some(&self.config.c_compiler),
            Language::Cpp => Some(&self.config.cpp_compiler),
            Language::Python => None,
        }
    }

    async fn compile(&self, workspace: &ScratchWorkspace, compiler: &str) -> Result<(), ExecError> {
        let mut cmd = child_command(compiler);
        cmd.arg(workspace.source_file_name())
            .arg("-o")
            .arg(workspace.binary_file_name())
            .current_dir(workspace.path());

        let limit = self.config.compile_timeout();
        let out = capture(cmd, limit, self.output_limit).await?;
        debug!(compiler, status = ?out.status, elapsed = ?out.elapsed, "Compile step finished");

        if !out.status.success() {
            return Err(ExecError::Compilation(diagnostics(&out.stdout, &out.stderr, || {
                describe_status(out.status)
            })));
        }
        if !workspace.binary_path().exists() {
            return Err(ExecError::Compilation("No executable produced".into()));
        }
        Ok(())
    }

    fn run_command(&self, workspace: &ScratchWorkspace) -> Command {
        let mut cmd = if workspace.language().is_compiled() {
            child_command(workspace.binary_path())
        } else {
            let mut cmd = child_command(&self.config.python);
            cmd.arg("-u").arg(workspace.source_file_name());
            cmd
        };
        cmd.current_dir(workspace.path());
        cmd
    }
}

#[async_trait]
impl IsolationBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Fallback
    }

    #[instrument(skip(self, workspace), fields(language = %workspace.language()))]
    async fn execute(&self, workspace: &ScratchWorkspace) -> Result<RunOutput, ExecError> {
        if let Some(compiler) = self.compiler(workspace.language()) {
            self.compile(workspace, compiler).await?;
        }

        let out = capture(
            self.run_command(workspace),
            self.config.run_timeout(),
            self.output_limit,
        )
        .await?;
        debug!(status = ?out.status, elapsed = ?out.elapsed, "Run step finished");

        if !out.status.success() {
            return Err(ExecError::Runtime {
                message: diagnostics("", &out.stderr, || describe_status(out.status)),
                output: out.stdout,
                runtime: out.elapsed,
            });
        }

        Ok(RunOutput {
            stdout: out.stdout,
            stderr: out.stderr,
            runtime: out.elapsed,
        })
    }
}

/// A command with a cleared environment plus [`INHERITED_ENV`].
fn child_command(program: impl AsRef<std::ffi::OsStr>) -> Command {
    let mut cmd = Command::new(program);
    cmd.env_clear();
    for key in INHERITED_ENV {
        if let Some(value) = std::env::var_os(key) {
            cmd.env(key, value);
        }
    }
    cmd
}

/// Human-readable description of a failed exit status.
fn describe_status(status: ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("Process exited with status {code}"),
        (None, Some(signal)) => format!("Process terminated by signal {signal}"),
        (None, None) => "Process terminated abnormally".into(),
    }
}
