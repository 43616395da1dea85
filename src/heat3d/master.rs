//! Coordinator side of heat3d: owns the scratch buffer and the barrier,
//! launches the ranks and steps them through every round.

use super::args::{add_common_arguments, keys, Heat3dParams};
use super::topology::scratch_len;
use super::{check_capabilities, Phase, WORKER_SUBCOMMAND};
use crate::backend::ComputeBackend;
use crate::barrier::{BarrierEvents, Coordinator};
use crate::config::{Config, Strategy};
use crate::error::Result;
use crate::ipc::{HandleExporter, PidfdExporter, SharedHandle, SocketExporter};
use crate::process::ProcessGroup;
use crate::result::TestResult;
use crate::stats::{MeasurementType, MeasurementUnit, StatisticsSink};

/// Runs heat3d with one worker per sub-domain and pushes the workers'
/// timings into `statistics`: per rank when there is more than one, and
/// averaged across ranks.
///
/// A failing worker makes the remaining barrier rounds time out; the
/// workers' own results are then reported in preference to the timeout.
pub fn run_master<B, S>(
    backend: &B,
    params: &Heat3dParams,
    config: &Config,
    statistics: &S,
) -> Result<TestResult>
where
    B: ComputeBackend,
    S: StatisticsSink + ?Sized,
{
    let (grid, sub) = params.validate()?;
    check_capabilities(&backend.capabilities())?;
    let n_ranks = grid.n_ranks();
    tracing::info!(
        ranks = n_ranks,
        sub_domain = ?[sub.nx, sub.ny, sub.nz],
        timesteps = params.n_timesteps,
        iterations = params.iterations,
        strategy = %config.strategy,
        "starting heat3d"
    );

    let scratch_bytes = scratch_len(n_ranks);
    let scratch = backend.allocate_device(scratch_bytes)?;
    backend.write(&scratch, 0, &vec![0u8; scratch_bytes])?;
    let pool = backend.create_event_pool(2 * n_ranks)?;
    let handles = [
        backend.export_buffer(&scratch)?,
        backend.export_event_pool(&pool)?,
    ];
    let mut coordinator = Coordinator::new(BarrierEvents::new(backend, &pool, n_ranks)?);

    let mut group =
        ProcessGroup::new(config.worker_exe()?, n_ranks as usize).with_subcommand(WORKER_SUBCOMMAND);
    for rank in 0..n_ranks {
        let process = &mut group[rank as usize];
        process.set_name(process_name(rank));
        add_common_arguments(process, params, config);
        process.add_argument(keys::RANK, rank.to_string());
        if config.strategy == Strategy::Pidfd {
            process.add_argument(keys::INIT_BUFFER_IPC_HANDLE, handles[0].to_hex());
            process.add_argument(keys::EV_POOL_IPC_HANDLE, handles[1].to_hex());
        }
    }
    if config.strategy == Strategy::Pidfd {
        PidfdExporter.export_handles(&handles)?;
    }

    group.run_all()?;

    let driven = drive(&mut group, &mut coordinator, params, config, n_ranks, &handles);

    tracing::debug!(phase = %Phase::Drain, rounds = coordinator.rounds(), "collecting workers");
    if let Err(e) = driven {
        tracing::warn!(error = %e, "heat3d coordination failed");
        let grace = config.barrier_timeout + config.sync_timeout;
        if let Err(wait) = group.wait_for_finish_all(grace) {
            tracing::warn!(error = %wait, "workers did not exit after the failure");
        }
        let result = group.result_all();
        return if result.is_success() { Err(e) } else { Ok(result) };
    }

    group.wait_for_finish_all(config.process_timeout)?;
    group.push_measurements_to_statistics(
        params.iterations,
        statistics,
        MeasurementUnit::Microseconds,
        MeasurementType::Cpu,
        n_ranks > 1,
        true,
    )
}

/// Name a rank's process and its statistics series go by.
pub fn process_name(rank: u32) -> String {
    format!("Heat3D Process #{rank}")
}

/// The coordinator's half of every round the workers pass.
fn drive<B: ComputeBackend>(
    group: &mut ProcessGroup,
    coordinator: &mut Coordinator<'_, B>,
    params: &Heat3dParams,
    config: &Config,
    n_ranks: u32,
    handles: &[SharedHandle; 2],
) -> Result<()> {
    tracing::debug!(phase = %Phase::AwaitHandshake, "entering phase");
    let exchange_rounds = match config.strategy {
        Strategy::Socket => {
            SocketExporter::new(config.master_socket_path(), n_ranks as usize, config)
                .export_handles(handles)?;
            2 * n_ranks
        }
        Strategy::Pidfd => 1,
    };

    tracing::debug!(phase = %Phase::InitBarrier, "entering phase");
    if n_ranks > 1 {
        for _ in 0..exchange_rounds {
            coordinator.round(config.barrier_timeout)?;
        }
    }

    tracing::debug!(phase = %Phase::SteadyStateCompute, "entering phase");
    for iteration in 0..params.iterations {
        coordinator.round(config.barrier_timeout)?;
        group.synchronize_all(1, config.sync_timeout)?;
        for _ in 0..params.n_timesteps {
            coordinator.round(config.barrier_timeout)?;
        }
        tracing::trace!(iteration, "iteration released");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Capabilities, HostBackend};
    use crate::error::Error;
    use crate::stats::Statistics;

    #[test]
    fn test_process_names() {
        assert_eq!(process_name(0), "Heat3D Process #0");
        assert_eq!(process_name(12), "Heat3D Process #12");
    }

    #[test]
    fn test_invalid_split_fails_before_spawning() {
        let backend = HostBackend::new();
        let config = Config::builder()
            .worker_exe("/nonexistent/mpbench-worker")
            .build()
            .unwrap();
        let params = Heat3dParams {
            sub_domains: [2, 2, 2],
            mesh_length: 4,
            ..Default::default()
        };
        let stats = Statistics::new();
        let err = run_master(&backend, &params, &config, &stats).unwrap_err();
        assert!(matches!(err, Error::InvalidArgs(_)));
        assert_eq!(TestResult::from(&err), TestResult::InvalidArgs);
    }

    #[test]
    fn test_backend_without_ipc_is_not_capable() {
        let backend = HostBackend::with_capabilities(Capabilities {
            name: "host",
            ipc_memory: false,
            ipc_events: true,
            sub_devices: 1,
        });
        let config = Config::builder()
            .worker_exe("/nonexistent/mpbench-worker")
            .build()
            .unwrap();
        let stats = Statistics::new();
        let err = run_master(&backend, &Heat3dParams::default(), &config, &stats).unwrap_err();
        assert_eq!(TestResult::from(&err), TestResult::DeviceNotCapable);
        assert!(stats.is_empty());
    }

    #[test]
    fn test_missing_worker_fails_to_start() {
        let backend = HostBackend::new();
        let dir = tempfile::tempdir().unwrap();
        let config = Config::builder()
            .socket_dir(dir.path())
            .worker_exe(dir.path().join("missing-worker"))
            .build()
            .unwrap();
        let params = Heat3dParams {
            mesh_length: 6,
            n_timesteps: 1,
            iterations: 1,
            ..Default::default()
        };
        let err = run_master(&backend, &params, &config, &Statistics::new()).unwrap_err();
        assert!(matches!(err, Error::Process(_)));
    }
}
