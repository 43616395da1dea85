//! One heat3d rank.

use super::args::Heat3dArgs;
use super::exchange::{exchange_halo_buffers, HaloTargets};
use super::stencil::{StencilKernels, VALUE_SIZE};
use super::topology::{Facet, SubDomain};
use super::{check_capabilities, Phase};
use crate::barrier::{BarrierEvents, Participant};
use crate::config::{Config, Strategy};
use crate::error::{Error, Result};
use crate::ipc::{HandleImporter, ImportedHandle, PidfdImporter, SocketImporter};
use crate::process::WorkloadContext;
use crate::result::TestResult;
use crate::stats::{MeasurementType, MeasurementUnit, StatisticsSink};
use std::time::Instant;

/// Receives the coordinator's scratch buffer and event pool handles.
fn import_shared(args: &Heat3dArgs, config: &Config) -> Result<(ImportedHandle, ImportedHandle)> {
    let imported = match args.strategy {
        Strategy::Socket => SocketImporter::new(&args.socket_path, config).import_handles(2)?,
        Strategy::Pidfd => {
            PidfdImporter::new(args.parent_pid, args.published_handles()?.to_vec()).import_handles(2)?
        }
    };
    let mut imported = imported.into_iter();
    match (imported.next(), imported.next()) {
        (Some(scratch), Some(pool)) => Ok((scratch, pool)),
        _ => Err(Error::protocol("coordinator sent fewer than two handles")),
    }
}

/// The rank's halo buffers and where each halo goes.
struct Halos<'a, B: StencilKernels> {
    backend: &'a B,
    sub: &'a SubDomain,
    send: &'a [B::Buffer],
    recv: &'a [B::Buffer],
    targets: &'a HaloTargets<B>,
}

impl<B: StencilKernels> Halos<'_, B> {
    fn send_all(&self) -> Result<()> {
        for facet in Facet::ALL {
            let len = self.sub.facet_len(facet) * VALUE_SIZE;
            let target = self.targets.target(facet, self.recv);
            self.backend.copy(target, 0, &self.send[facet.index()], 0, len)?;
        }
        Ok(())
    }

    fn pack_all(&self, domain: &B::Buffer) -> Result<()> {
        for facet in Facet::ALL {
            self.backend
                .pack_send_buffer(domain, &self.send[facet.index()], self.sub, facet)?;
        }
        Ok(())
    }

    fn unpack_all(&self, domain: &B::Buffer) -> Result<()> {
        for facet in Facet::ALL {
            self.backend
                .unpack_recv_buffer(&self.recv[facet.index()], domain, self.sub, facet)?;
        }
        Ok(())
    }
}

fn allocate_halos<B: StencilKernels>(backend: &B, sub: &SubDomain) -> Result<Vec<B::Buffer>> {
    Facet::ALL
        .iter()
        .map(|&facet| backend.allocate_device(sub.facet_len(facet) * VALUE_SIZE))
        .collect()
}

/// Runs `args.iterations` timed iterations of `args.nTimesteps` steps and
/// pushes one duration per iteration into the workload statistics.
pub fn run_worker<B: StencilKernels>(
    backend: &B,
    args: &Heat3dArgs,
    ctx: &mut WorkloadContext<'_>,
) -> Result<TestResult> {
    let params = args.params();
    let (grid, sub) = params.validate()?;
    check_capabilities(&backend.capabilities())?;
    let config = args.config()?;
    let rank = args.rank;
    if rank >= grid.n_ranks() {
        return Err(Error::invalid_args(format!(
            "rank {rank} outside a grid of {} ranks",
            grid.n_ranks()
        )));
    }
    let coords = grid.coords_of(rank);
    tracing::debug!(rank, ?coords, neighbors = ?grid.neighbors(rank), "heat3d worker starting");

    let domain_bytes = sub.padded_len() * VALUE_SIZE;
    let mut old = backend.allocate_device(domain_bytes)?;
    let mut new = backend.allocate_device(domain_bytes)?;
    let send = allocate_halos(backend, &sub)?;
    let recv = allocate_halos(backend, &sub)?;

    tracing::debug!(rank, phase = %Phase::AwaitHandshake, "entering phase");
    let (scratch, pool) = import_shared(args, &config)?;
    let scratch = backend.import_buffer(scratch)?;
    let pool = backend.import_event_pool(pool)?;
    let mut participant = Participant::new(BarrierEvents::new(backend, &pool, grid.n_ranks())?, rank)?;

    tracing::debug!(rank, phase = %Phase::InitBarrier, "entering phase");
    let targets = exchange_halo_buffers(backend, &config, &mut participant, &grid, &recv, &scratch)?;
    let halos = Halos {
        backend,
        sub: &sub,
        send: &send,
        recv: &recv,
        targets: &targets,
    };

    tracing::debug!(rank, phase = %Phase::SteadyStateCompute, "entering phase");
    let weight = params.weight();
    for iteration in 0..params.iterations {
        backend.init_temperature(&new, &sub, coords, params.delta_space())?;
        halos.pack_all(&new)?;
        halos.send_all()?;
        backend.synchronize()?;
        participant.arrive_and_wait(config.barrier_timeout)?;
        halos.unpack_all(&new)?;
        std::mem::swap(&mut old, &mut new);

        ctx.synchronization.synchronize(ctx.io)?;

        let start = Instant::now();
        for _ in 0..params.n_timesteps {
            for facet in Facet::ALL {
                backend.update_facet(&old, &new, &sub, facet, weight)?;
                backend.pack_send_buffer(&new, &send[facet.index()], &sub, facet)?;
            }
            halos.send_all()?;
            backend.update_interior(&old, &new, &sub, weight)?;
            backend.synchronize()?;
            participant.arrive_and_wait(config.barrier_timeout)?;
            halos.unpack_all(&new)?;
            std::mem::swap(&mut old, &mut new);
        }
        let elapsed = start.elapsed();

        ctx.statistics
            .push_value(elapsed, MeasurementUnit::Unknown, MeasurementType::Unknown, "")?;
        tracing::trace!(rank, iteration, ?elapsed, "iteration done");
    }

    tracing::debug!(rank, phase = %Phase::Drain, rounds = participant.rounds(), "entering phase");
    Ok(TestResult::Success)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Capabilities, ComputeBackend, HostBackend};
    use crate::barrier::Coordinator;
    use crate::heat3d::topology::scratch_len;
    use crate::ipc::{HandleExporter, SocketExporter};
    use crate::process::{run_workload, WorkloadArgs};
    use clap::Parser;
    use std::thread;
    use std::time::Duration;

    #[derive(Debug, Parser)]
    struct Cli {
        #[command(flatten)]
        args: Heat3dArgs,
    }

    fn args(socket_path: &std::path::Path, extra: &[&str]) -> Heat3dArgs {
        let mut argv = vec!["worker".to_string()];
        if !extra.iter().any(|s| s.starts_with("--rank")) {
            argv.push("--rank=0".to_string());
        }
        argv.extend([
            format!("--parentPid={}", std::process::id()),
            "--meshLength=6".to_string(),
            "--nTimesteps=2".to_string(),
            "--iterations=3".to_string(),
            "--barrierTimeoutMs=10000".to_string(),
            format!("--socketPath={}", socket_path.display()),
        ]);
        argv.extend(extra.iter().map(|s| s.to_string()));
        Cli::try_parse_from(argv).unwrap().args
    }

    #[test]
    fn test_single_rank_in_process() {
        let backend = HostBackend::new();
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("heat3d.socket");
        let args = args(&socket_path, &[]);
        let config = args.config().unwrap();

        let scratch = backend.allocate_device(scratch_len(1)).unwrap();
        let pool = backend.create_event_pool(2).unwrap();
        let handles = [
            backend.export_buffer(&scratch).unwrap(),
            backend.export_event_pool(&pool).unwrap(),
        ];

        let result = thread::scope(|s| {
            let worker = s.spawn(|| {
                let options = WorkloadArgs::default().options(3, 3, Duration::from_secs(5));
                run_workload(&options, |ctx| {
                    let result = run_worker(&HostBackend::new(), &args, ctx)?;
                    assert_eq!(ctx.statistics.len(), 3);
                    assert_eq!(ctx.synchronization.performed(), 3);
                    Ok(result)
                })
            });

            SocketExporter::new(&socket_path, 1, &config)
                .export_handles(&handles)
                .unwrap();
            let mut coordinator =
                Coordinator::new(BarrierEvents::new(&backend, &pool, 1).unwrap());
            for _ in 0..3 * (1 + 2) {
                coordinator.round(Duration::from_secs(10)).unwrap();
            }
            worker.join().unwrap()
        });
        assert_eq!(result, TestResult::Success);
        assert!(!socket_path.exists());
    }

    #[test]
    fn test_rank_outside_grid() {
        let dir = tempfile::tempdir().unwrap();
        let args = args(&dir.path().join("heat3d.socket"), &["--rank=1"]);
        let options = WorkloadArgs::default().options(3, 3, Duration::from_millis(10));
        let result = run_workload(&options, |ctx| run_worker(&HostBackend::new(), &args, ctx));
        assert_eq!(result, TestResult::InvalidArgs);
    }

    #[test]
    fn test_tiled_device_not_capable() {
        let dir = tempfile::tempdir().unwrap();
        let args = args(&dir.path().join("heat3d.socket"), &[]);
        let backend = HostBackend::with_capabilities(Capabilities {
            sub_devices: 2,
            ..HostBackend::new().capabilities()
        });
        let options = WorkloadArgs::default().options(3, 3, Duration::from_millis(10));
        let result = run_workload(&options, |ctx| run_worker(&backend, &args, ctx));
        assert_eq!(result, TestResult::DeviceNotCapable);
    }
}
