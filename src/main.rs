//! algo-runner
//!
//! Runs submitted Python, C and C++ programs in Docker containers, falling
//! back to local processes when Docker is unreachable. Serves a REST API by
//! default, or MCP over stdio with `--stdio`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use algo_runner::backend::{DockerBackend, IsolationBackend, LocalBackend};
use algo_runner::config::Config;
use algo_runner::http::{self, AppState};
use algo_runner::mcp;
use algo_runner::orchestrator::Orchestrator;
use algo_runner::report::{RunReporter, SupabaseReporter};
use algo_runner::workspace::Stager;

#[derive(Parser, Debug)]
#[command(name = "algo-runner")]
#[command(about = "Sandboxed code runner for algorithm submissions")]
struct Args {
    /// Run in stdio mode (for MCP clients) instead of serving HTTP
    #[arg(long)]
    stdio: bool,

    /// Address for the HTTP server
    #[arg(long, default_value = "127.0.0.1:8000")]
    listen: SocketAddr,

    /// Path to a JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Skip the Docker sandbox and always run locally
    #[arg(long)]
    no_sandbox: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging (stderr so stdout is free for MCP protocol)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    if args.no_sandbox {
        config.sandbox.enabled = false;
    }

    let orchestrator = Arc::new(build_orchestrator(&config));
    info!(
        scratch_root = %config.scratch_root().display(),
        sandbox = orchestrator.has_sandbox(),
        reporter = config.reporter.is_some(),
        "Loaded configuration"
    );

    if args.stdio {
        mcp::serve_stdio(orchestrator).await?;
    } else {
        let reporter = config
            .reporter
            .as_ref()
            .map(|r| Arc::new(SupabaseReporter::new(r)) as Arc<dyn RunReporter>);
        http::serve(
            args.listen,
            AppState {
                orchestrator,
                reporter,
            },
        )
        .await?;
    }

    Ok(())
}

fn build_orchestrator(config: &Config) -> Orchestrator {
    let sandbox = if config.sandbox.enabled {
        match DockerBackend::connect(config.sandbox.clone()) {
            Ok(backend) => Some(
                Arc::new(backend.with_output_limit(config.max_output_bytes))
                    as Arc<dyn IsolationBackend>,
            ),
            Err(e) => {
                warn!(error = %e, "Docker client unavailable, using local execution only");
                None
            }
        }
    } else {
        None
    };

    Orchestrator::new(
        Stager::new(config.scratch_root()),
        sandbox,
        Arc::new(
            LocalBackend::new(config.fallback.clone()).with_output_limit(config.max_output_bytes),
        ),
        config.max_output_bytes,
    )
}
