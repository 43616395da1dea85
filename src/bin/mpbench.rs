//! mpbench coordinator
//!
//! Usage:
//!   mpbench [-v] heat3d [options]
//!
//! Launches `mpbench-worker` ranks next to this binary (or `--worker`),
//! drives them, and prints their timings.

use clap::{Args, Parser, Subcommand};
use mpbench::prelude::*;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "mpbench")]
#[command(version, about = "Multi-process GPU microbenchmarks", long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Distributed 3D heat equation with halo exchange between ranks
    Heat3d(Heat3dCommand),
}

#[derive(Args)]
struct Heat3dCommand {
    /// How IPC handles reach the workers (socket or pidfd)
    #[arg(long, default_value_t = Strategy::Socket)]
    strategy: Strategy,

    /// Directory for the rendezvous sockets
    #[arg(long, default_value = "/tmp")]
    socket_dir: PathBuf,

    /// Sub-domains along x
    #[arg(long, default_value_t = 1)]
    nx: u32,

    /// Sub-domains along y
    #[arg(long, default_value_t = 1)]
    ny: u32,

    /// Sub-domains along z
    #[arg(long, default_value_t = 1)]
    nz: u32,

    /// Points per side of the whole mesh
    #[arg(long, default_value_t = 64)]
    mesh_length: u32,

    /// Timesteps per timed iteration
    #[arg(long, default_value_t = 10)]
    timesteps: u32,

    #[arg(long, default_value_t = 10)]
    iterations: usize,

    /// Upper bound on any single barrier or synchronization wait
    #[arg(long, default_value_t = 120_000)]
    barrier_timeout_ms: u64,

    /// Upper bound on the whole run after the workers start
    #[arg(long, default_value_t = 600)]
    process_timeout_secs: u64,

    /// Worker executable, defaults to mpbench-worker next to this binary
    #[arg(long)]
    worker: Option<PathBuf>,

    /// Also write a JSON report here
    #[arg(long)]
    json: Option<PathBuf>,
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn heat3d(cmd: &Heat3dCommand, verbose: bool) -> Result<TestResult> {
    let barrier_timeout = Duration::from_millis(cmd.barrier_timeout_ms);
    let mut builder = Config::builder()
        .strategy(cmd.strategy)
        .socket_dir(&cmd.socket_dir)
        .barrier_timeout(barrier_timeout)
        .sync_timeout(barrier_timeout)
        .process_timeout(Duration::from_secs(cmd.process_timeout_secs));
    if let Some(worker) = &cmd.worker {
        builder = builder.worker_exe(worker);
    }
    let config = builder.build()?;

    let params = Heat3dParams {
        sub_domains: [cmd.nx, cmd.ny, cmd.nz],
        mesh_length: cmd.mesh_length,
        n_timesteps: cmd.timesteps,
        iterations: cmd.iterations,
    };

    let statistics = Statistics::new();
    let result = heat3d::run_master(&HostBackend::new(), &params, &config, &statistics)?;
    if result.is_success() {
        ConsoleExporter::new(verbose).export("heat3d", &statistics)?;
        if let Some(path) = &cmd.json {
            JsonExporter::new(path).export("heat3d", &statistics)?;
        }
    }
    Ok(result)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match &cli.command {
        Command::Heat3d(cmd) => heat3d(cmd, cli.verbose > 0).unwrap_or_else(|e| {
            tracing::error!(error = %e, "heat3d failed");
            TestResult::from(&e)
        }),
    };
    if !result.is_success() {
        eprintln!("heat3d: {result}");
    }
    result.into()
}
