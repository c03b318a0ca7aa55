//! Runner configuration.
//!
//! Read from an optional JSON file (`--config` or `RUNNER_CONFIG`), with every
//! field defaulted. A handful of environment variables override the file so
//! deployments can inject secrets without touching it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info};

/// Top-level configuration for the runner.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Container sandbox settings.
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Local fallback settings.
    #[serde(default)]
    pub fallback: FallbackConfig,

    /// Scratch workspace settings.
    #[serde(default)]
    pub workspace: WorkspaceConfig,

    /// Upper bound on output (and error text) returned to callers.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Result reporter (optional). Without it runs are not recorded.
    #[serde(default)]
    pub reporter: Option<ReporterConfig>,
}

/// Docker sandbox configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SandboxConfig {
    /// Whether to try the sandbox at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Image providing gcc/g++ for both compile and run containers.
    #[serde(default = "default_compiler_image")]
    pub compiler_image: String,

    /// Image providing the Python interpreter.
    #[serde(default = "default_python_image")]
    pub python_image: String,

    /// Memory ceiling per container in megabytes.
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,

    /// Maximum number of processes per container.
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,

    #[serde(default = "default_compile_timeout")]
    pub compile_timeout_seconds: u64,

    #[serde(default = "default_sandbox_run_timeout")]
    pub run_timeout_seconds: u64,
}

/// Local (unisolated) execution configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FallbackConfig {
    #[serde(default = "default_c_compiler")]
    pub c_compiler: String,

    #[serde(default = "default_cpp_compiler")]
    pub cpp_compiler: String,

    #[serde(default = "default_python")]
    pub python: String,

    #[serde(default = "default_compile_timeout")]
    pub compile_timeout_seconds: u64,

    #[serde(default = "default_fallback_run_timeout")]
    pub run_timeout_seconds: u64,
}

/// Where per-request workspaces are created.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct WorkspaceConfig {
    /// Scratch root. Defaults to `<system temp>/algo-runner`.
    #[serde(default)]
    pub scratch_root: Option<PathBuf>,
}

/// Supabase (PostgREST) connection for recording runs.
#[derive(Debug, Clone, Deserialize)]
pub struct ReporterConfig {
    pub url: String,
    pub api_key: String,
    #[serde(default = "default_table")]
    pub table: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sandbox: SandboxConfig::default(),
            fallback: FallbackConfig::default(),
            workspace: WorkspaceConfig::default(),
            max_output_bytes: default_max_output_bytes(),
            reporter: None,
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            compiler_image: default_compiler_image(),
            python_image: default_python_image(),
            memory_mb: default_memory_mb(),
            pids_limit: default_pids_limit(),
            compile_timeout_seconds: default_compile_timeout(),
            run_timeout_seconds: default_sandbox_run_timeout(),
        }
    }
}

impl SandboxConfig {
    pub const fn compile_timeout(&self) -> Duration {
        Duration::from_secs(self.compile_timeout_seconds)
    }

    pub const fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_seconds)
    }

    pub const fn memory_bytes(&self) -> i64 {
        // Saturate rather than wrap for absurd values.
        let bytes = self.memory_mb.saturating_mul(1024 * 1024);
        if bytes > i64::MAX as u64 {
            i64::MAX
        } else {
            bytes as i64
        }
    }
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            c_compiler: default_c_compiler(),
            cpp_compiler: default_cpp_compiler(),
            python: default_python(),
            compile_timeout_seconds: default_compile_timeout(),
            run_timeout_seconds: default_fallback_run_timeout(),
        }
    }
}

impl FallbackConfig {
    pub const fn compile_timeout(&self) -> Duration {
        Duration::from_secs(self.compile_timeout_seconds)
    }

    pub const fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_seconds)
    }
}

impl Config {
    /// Load configuration.
    ///
    /// Priority: environment overrides > JSON file > defaults. The file is
    /// `path` when given, else `RUNNER_CONFIG` when set.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("RUNNER_CONFIG").map(PathBuf::from));

        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                let config = Self::from_json(&raw)
                    .with_context(|| format!("Failed to parse config file {}", path.display()))?;
                info!(path = %path.display(), "Loaded configuration file");
                config
            }
            None => {
                debug!("No configuration file, using defaults");
                Self::default()
            }
        };

        config.apply_env();
        Ok(config)
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        Ok(config)
    }

    /// Apply `RUNNER_SCRATCH_DIR`, `SUPABASE_URL` and `SUPABASE_KEY`.
    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("RUNNER_SCRATCH_DIR") {
            if !dir.is_empty() {
                self.workspace.scratch_root = Some(PathBuf::from(dir));
            }
        }

        let url = std::env::var("SUPABASE_URL").ok().filter(|v| !v.is_empty());
        let key = std::env::var("SUPABASE_KEY").ok().filter(|v| !v.is_empty());
        if let (Some(url), Some(api_key)) = (url, key) {
            let table = self
                .reporter
                .as_ref()
                .map_or_else(default_table, |r| r.table.clone());
            self.reporter = Some(ReporterConfig {
                url,
                api_key,
                table,
            });
        }
    }

    /// Resolve the scratch root to an absolute path.
    pub fn scratch_root(&self) -> PathBuf {
        match &self.workspace.scratch_root {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => std::env::current_dir().unwrap_or_default().join(p),
            None => std::env::temp_dir().join("algo-runner"),
        }
    }
}

const fn default_true() -> bool {
    true
}

fn default_compiler_image() -> String {
    "gcc:latest".into()
}

fn default_python_image() -> String {
    "python:3.13-slim".into()
}

const fn default_memory_mb() -> u64 {
    256
}

const fn default_pids_limit() -> i64 {
    64
}

const fn default_compile_timeout() -> u64 {
    30
}

const fn default_sandbox_run_timeout() -> u64 {
    10
}

const fn default_fallback_run_timeout() -> u64 {
    5
}

fn default_c_compiler() -> String {
    "gcc".into()
}

fn default_cpp_compiler() -> String {
    "g++".into()
}

fn default_python() -> String {
    "python3".into()
}

fn default_table() -> String {
    "runtime_logs".into()
}

const fn default_max_output_bytes() -> usize {
    64 * 1024
}
