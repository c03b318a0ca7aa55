//! Docker sandbox backend.
//!
//! Compiled languages run as two containers: a compiler container with the
//! workspace mounted read-write, then a run container with it mounted
//! read-only. Interpreted sources run in a single container. Every container
//! has a memory ceiling, a pids limit and no network, and is force-removed
//! when the step ends, whichever way it ends.

use std::os::unix::fs::MetadataExt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::errors::Error as DockerError;
use bollard::models::{ContainerCreateBody, ContainerWaitResponse, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::Docker;
use futures_util::stream::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{append_bounded, diagnostics, IsolationBackend, RunOutput, DEFAULT_OUTPUT_LIMIT};
use crate::config::SandboxConfig;
use crate::error::ExecError;
use crate::types::{BackendKind, Language};
use crate::workspace::ScratchWorkspace;

/// Mount point of the workspace inside every container.
const CONTAINER_WORKDIR: &str = "/workspace";

/// Backend that runs submissions in Docker containers.
#[derive(Debug, Clone)]
pub struct DockerBackend {
    docker: Docker,
    config: SandboxConfig,
    output_limit: usize,
}

/// How a container step ended, when it ran to completion.
#[derive(Debug)]
struct ContainerExit {
    exit_code: i64,
    stdout: String,
    stderr: String,
    elapsed: Duration,
}

impl DockerBackend {
    /// Connect using the platform defaults (`DOCKER_HOST` or the local socket).
    pub fn connect(config: SandboxConfig) -> Result<Self, DockerError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self::with_client(docker, config))
    }

    /// Wrap an already constructed client.
    #[must_use]
    pub const fn with_client(docker: Docker, config: SandboxConfig) -> Self {
        Self {
            docker,
            config,
            output_limit: DEFAULT_OUTPUT_LIMIT,
        }
    }

    /// Cap on bytes kept from each container output stream.
    #[must_use]
    pub const fn with_output_limit(mut self, output_limit: usize) -> Self {
        self.output_limit = output_limit;
        self
    }

    fn image_for(&self, language: Language) -> &str {
        match language {
            Language::Python => &self.config.python_image,
            Language::C | Language::Cpp => &self.config.compiler_image,
        }
    }

    /// Pull `image` unless it is already present.
    async fn ensure_image(&self, image: &str) -> Result<(), ExecError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        info!(image, "Pulling sandbox image");
        let options = CreateImageOptions {
            from_image: Some(image.to_string()),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            progress.map_err(|e| {
                ExecError::SandboxUnavailable(format!("Failed to pull image {image}: {e}"))
            })?;
        }
        Ok(())
    }

    async fn compile(
        &self,
        workspace: &ScratchWorkspace,
        compiler: &str,
        image: &str,
    ) -> Result<(), ExecError> {
        let cmd = vec![
            compiler.to_string(),
            format!("{CONTAINER_WORKDIR}/{}", workspace.source_file_name()),
            "-o".to_string(),
            format!("{CONTAINER_WORKDIR}/{}", workspace.binary_file_name()),
        ];

        let exit = self
            .run_container(workspace, image, cmd, false, self.config.compile_timeout())
            .await?;
        debug!(exit_code = exit.exit_code, elapsed = ?exit.elapsed, "Compile container finished");

        if exit.exit_code != 0 {
            return Err(ExecError::Compilation(diagnostics(
                &exit.stdout,
                &exit.stderr,
                || format!("Compiler exited with status {}", exit.exit_code),
            )));
        }
        if !workspace.binary_path().exists() {
            return Err(ExecError::Compilation("No executable produced".into()));
        }
        Ok(())
    }

    /// Create, start and wait for one container, always removing it.
    async fn run_container(
        &self,
        workspace: &ScratchWorkspace,
        image: &str,
        cmd: Vec<String>,
        read_only: bool,
        limit: Duration,
    ) -> Result<ContainerExit, ExecError> {
        let host_dir = workspace.path().to_str().ok_or_else(|| {
            ExecError::Unexpected("Workspace path is not valid UTF-8".into())
        })?;

        // Run as the workspace owner so compiler output stays removable.
        let owner = std::fs::metadata(workspace.path())
            .map(|meta| format!("{}:{}", meta.uid(), meta.gid()))
            .map_err(ExecError::Staging)?;

        let options = CreateContainerOptions {
            name: Some(format!("algo-runner-{}", Uuid::new_v4())),
            ..Default::default()
        };
        let mount = Mount {
            host_dir,
            read_only,
            owner: &owner,
        };
        let body = container_body(image, cmd, &mount, &self.config);

        let created = self
            .docker
            .create_container(Some(options), body)
            .await
            .map_err(classify)?;
        let guard = ContainerGuard::new(self.docker.clone(), created.id.clone());
        let id = created.id.as_str();

        let started = Instant::now();
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await
            .map_err(classify)?;

        let mut wait = self.docker.wait_container(id, None::<WaitContainerOptions>);
        let waited = tokio::time::timeout(limit, wait.next()).await;
        let elapsed = started.elapsed();
        drop(wait);

        let Ok(next) = waited else {
            warn!(container = %id, ?limit, "Container timed out, removing");
            guard.remove().await;
            return Err(ExecError::Timeout { limit, elapsed });
        };
        let exit_code = wait_exit_code(next)?;

        let (stdout, stderr) = self.collect_logs(id).await?;
        guard.remove().await;

        Ok(ContainerExit {
            exit_code,
            stdout,
            stderr,
            elapsed,
        })
    }

    async fn collect_logs(&self, id: &str) -> Result<(String, String), ExecError> {
        let options = LogsOptions {
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut stream = self.docker.logs(id, Some(options));

        let mut logs = BoundedLogs::new(self.output_limit);
        while let Some(chunk) = stream.next().await {
            if logs.push(chunk.map_err(classify)?) {
                debug!(container = %id, "Output limit reached, skipping remaining logs");
                break;
            }
        }
        Ok(logs.into_strings())
    }
}

#[async_trait]
impl IsolationBackend for DockerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sandbox
    }

    async fn is_available(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    #[instrument(skip(self, workspace), fields(language = %workspace.language()))]
    async fn execute(&self, workspace: &ScratchWorkspace) -> Result<RunOutput, ExecError> {
        self.docker
            .ping()
            .await
            .map_err(|e| ExecError::SandboxUnavailable(format!("Docker is not reachable: {e}")))?;

        let language = workspace.language();
        let image = self.image_for(language).to_string();
        self.ensure_image(&image).await?;

        let cmd = match language {
            Language::C | Language::Cpp => {
                let compiler = if language == Language::Cpp { "g++" } else { "gcc" };
                self.compile(workspace, compiler, &image).await?;
                vec![format!("{CONTAINER_WORKDIR}/{}", workspace.binary_file_name())]
            }
            Language::Python => vec![
                "python".to_string(),
                "-u".to_string(),
                format!("{CONTAINER_WORKDIR}/{}", workspace.source_file_name()),
            ],
        };

        let exit = self
            .run_container(workspace, &image, cmd, true, self.config.run_timeout())
            .await?;
        debug!(exit_code = exit.exit_code, elapsed = ?exit.elapsed, "Run container finished");

        if exit.exit_code != 0 {
            return Err(ExecError::Runtime {
                message: diagnostics("", &exit.stderr, || {
                    format!("Process exited with status {}", exit.exit_code)
                }),
                output: exit.stdout,
                runtime: exit.elapsed,
            });
        }

        Ok(RunOutput {
            stdout: exit.stdout,
            stderr: exit.stderr,
            runtime: exit.elapsed,
        })
    }
}

/// Exit code from the first item of a wait stream.
fn wait_exit_code(next: Option<Result<ContainerWaitResponse, DockerError>>) -> Result<i64, ExecError> {
    match next {
        Some(Ok(response)) => Ok(response.status_code),
        // Non-zero exits are reported through the error channel.
        Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
        Some(Err(e)) => Err(classify(e)),
        None => Err(ExecError::Unexpected(
            "Container wait stream ended unexpectedly".into(),
        )),
    }
}

/// Container log collector keeping at most `limit + 1` bytes per stream.
struct BoundedLogs {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    keep: usize,
}

impl BoundedLogs {
    const fn new(limit: usize) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            keep: limit.saturating_add(1),
        }
    }

    /// Add one chunk. Returns `true` once both streams are full.
    fn push(&mut self, chunk: LogOutput) -> bool {
        match chunk {
            LogOutput::StdOut { message } | LogOutput::Console { message } => {
                append_bounded(&mut self.stdout, &message, self.keep);
            }
            LogOutput::StdErr { message } => append_bounded(&mut self.stderr, &message, self.keep),
            LogOutput::StdIn { .. } => {}
        }
        self.stdout.len() >= self.keep && self.stderr.len() >= self.keep
    }

    fn into_strings(self) -> (String, String) {
        (
            String::from_utf8_lossy(&self.stdout).into_owned(),
            String::from_utf8_lossy(&self.stderr).into_owned(),
        )
    }
}

/// How the workspace is exposed to a container.
struct Mount<'a> {
    host_dir: &'a str,
    read_only: bool,
    /// `uid:gid` the container process runs as.
    owner: &'a str,
}

/// Build the container definition for one step.
fn container_body(
    image: &str,
    cmd: Vec<String>,
    mount: &Mount<'_>,
    config: &SandboxConfig,
) -> ContainerCreateBody {
    let mode = if mount.read_only { "ro" } else { "rw" };
    let memory = config.memory_bytes();

    ContainerCreateBody {
        image: Some(image.to_string()),
        cmd: Some(cmd),
        user: Some(mount.owner.to_string()),
        working_dir: Some(CONTAINER_WORKDIR.to_string()),
        network_disabled: Some(true),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        host_config: Some(HostConfig {
            binds: Some(vec![format!(
                "{}:{CONTAINER_WORKDIR}:{mode}",
                mount.host_dir
            )]),
            memory: Some(memory),
            memory_swap: Some(memory),
            pids_limit: Some(config.pids_limit),
            network_mode: Some("none".to_string()),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Map a Docker client error onto the execution taxonomy.
///
/// A response from the daemon means it is reachable, so anything it rejects
/// is unexpected; transport failures mean the sandbox is unavailable.
fn classify(err: DockerError) -> ExecError {
    match err {
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } => ExecError::Unexpected(format!("Docker daemon returned {status_code}: {message}")),
        other => ExecError::SandboxUnavailable(other.to_string()),
    }
}

/// Force-removes a container when dropped, unless removed explicitly first.
struct ContainerGuard {
    docker: Docker,
    id: Option<String>,
}

impl ContainerGuard {
    const fn new(docker: Docker, id: String) -> Self {
        Self {
            docker,
            id: Some(id),
        }
    }

    async fn remove(mut self) {
        if let Some(id) = self.id.take() {
            remove_container(&self.docker, &id).await;
        }
    }

    /// Hand removal to a background task. `None` when already removed or
    /// when there is no runtime to spawn on.
    fn spawn_removal(&mut self) -> Option<JoinHandle<()>> {
        let id = self.id.take()?;
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(container = %id, "No runtime to remove container");
            return None;
        };
        let docker = self.docker.clone();
        Some(handle.spawn(async move { remove_container(&docker, &id).await }))
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        drop(self.spawn_removal());
    }
}

async fn remove_container(docker: &Docker, id: &str) {
    let options = RemoveContainerOptions {
        force: true,
        v: true,
        ..Default::default()
    };
    match docker.remove_container(id, Some(options)).await {
        Ok(()) => debug!(container = %id, "Removed container"),
        Err(e) => warn!(container = %id, error = %e, "Failed to remove container"),
    }
}
