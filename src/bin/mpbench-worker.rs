//! mpbench worker
//!
//! Spawned by the coordinator once per rank. The exit code is the rank's
//! `TestResult`; timings go back over the measurement pipe.
//!
//! Subcommands:
//!   heat3d - one heat3d rank
//!   probe  - records fixed timings and synchronizes, for exercising the
//!            process protocol

use clap::{Args, Parser, Subcommand};
use mpbench::prelude::*;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "mpbench-worker")]
#[command(version, about = "Worker process for mpbench", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Heat3d(Heat3dArgs),
    Probe(ProbeArgs),
}

#[derive(Args)]
struct ProbeArgs {
    #[arg(long, default_value_t = 1)]
    iterations: usize,

    /// Synchronization points to pass before reporting
    #[arg(long = "syncPoints", default_value_t = 0)]
    sync_points: usize,

    /// Value reported for every iteration, in nanoseconds
    #[arg(long = "valueNs", default_value_t = 1_000)]
    value_ns: u64,

    /// Exit code to finish with; non-zero skips the measurements
    #[arg(long, default_value_t = 0)]
    result: i32,

    /// Sleep before finishing
    #[arg(long = "sleepMs", default_value_t = 0)]
    sleep_ms: u64,

    #[arg(long = "syncTimeoutMs", default_value_t = 30_000)]
    sync_timeout_ms: u64,

    #[command(flatten)]
    workload: WorkloadArgs,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn probe(args: &ProbeArgs) -> TestResult {
    let options = args.workload.options(
        args.iterations,
        args.sync_points,
        Duration::from_millis(args.sync_timeout_ms),
    );
    run_workload(&options, |ctx| {
        let result = TestResult::from_exit_code(args.result);
        if !result.is_success() {
            return Ok(result);
        }
        for _ in 0..args.sync_points {
            ctx.synchronization.synchronize(ctx.io)?;
        }
        for _ in 0..args.iterations {
            ctx.statistics.push_value(
                Duration::from_nanos(args.value_ns),
                MeasurementUnit::Unknown,
                MeasurementType::Unknown,
                "",
            )?;
        }
        std::thread::sleep(Duration::from_millis(args.sleep_ms));
        Ok(TestResult::Success)
    })
}

fn heat3d(args: &Heat3dArgs) -> TestResult {
    let options = args
        .workload
        .options(args.iterations, args.iterations, args.barrier_timeout());
    let backend = HostBackend::new();
    run_workload(&options, |ctx| heat3d::run_worker(&backend, args, ctx))
}

fn main() -> ExitCode {
    init_tracing();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if !e.use_stderr() => e.exit(),
        Err(e) => {
            let _ = e.print();
            return TestResult::InvalidArgs.into();
        }
    };

    let result = match &cli.command {
        Command::Heat3d(args) => heat3d(args),
        Command::Probe(args) => probe(args),
    };
    result.into()
}
