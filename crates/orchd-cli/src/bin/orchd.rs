//! orchd server entry point.
//!
//! Usage:
//!   orchd <out_dir> <nslots> <fcfs|sjf>
//!
//! Runs until killed. Task output lands in `<out_dir>/<id>.out` / `.err`,
//! completions in `<out_dir>/log.bin`.

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};

use orchd_kernel::{Orchestrator, OrchestratorConfig, Policy, StartupError};
use orchd_protocol::{IpcError, PipePaths};

fn main() -> ExitCode {
    orchd_cli::init_tracing();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:?}");
            ExitCode::FAILURE
        }
    }
}

fn usage(program: &str) -> String {
    format!("Usage: {program} <out_dir> <nslots> <fcfs|sjf>")
}

fn parse_args(args: &[String]) -> Result<OrchestratorConfig> {
    let program = args.first().map(String::as_str).unwrap_or("orchd");
    let [_, out_dir, nslots, policy] = args else {
        bail!("{}", usage(program));
    };

    let nslots: usize = nslots
        .parse()
        .ok()
        .filter(|n| *n > 0)
        .with_context(|| usage(program))?;
    let policy: Policy = policy.parse().with_context(|| usage(program))?;

    Ok(OrchestratorConfig {
        out_dir: PathBuf::from(out_dir),
        nslots,
        policy,
        paths: PipePaths::default(),
    })
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    let config = parse_args(&args)?;

    std::fs::create_dir_all(&config.out_dir)
        .with_context(|| format!("cannot create output directory {}", config.out_dir.display()))?;

    // Single-threaded cooperative loop: all parallelism comes from the
    // pipeline subprocesses, never from the runtime.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    runtime.block_on(async {
        let mut orchestrator = Orchestrator::new(config).map_err(|e| match e {
            StartupError::Ipc(IpcError::AlreadyExists) => {
                anyhow::anyhow!("Server's FIFO already exists. Is the server running?")
            }
            other => anyhow::Error::new(other),
        })?;
        orchestrator.run().await.context("server loop failed")
    })
}
