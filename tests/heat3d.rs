use mpbench::prelude::*;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

const WORKER: &str = env!("CARGO_BIN_EXE_mpbench-worker");

fn config(socket_dir: &Path, strategy: Strategy, worker: &Path) -> Config {
    Config::builder()
        .strategy(strategy)
        .socket_dir(socket_dir)
        .worker_exe(worker)
        .barrier_timeout(Duration::from_secs(30))
        .sync_timeout(Duration::from_secs(30))
        .accept_timeout(Duration::from_secs(30))
        .process_timeout(Duration::from_secs(120))
        .build()
        .unwrap()
}

fn small(sub_domains: [u32; 3]) -> Heat3dParams {
    Heat3dParams {
        sub_domains,
        mesh_length: 8,
        n_timesteps: 3,
        iterations: 4,
    }
}

#[test]
fn test_single_rank_socket() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), Strategy::Socket, Path::new(WORKER));
    let stats = Statistics::new();

    let result = heat3d::run_master(&HostBackend::new(), &small([1, 1, 1]), &config, &stats).unwrap();
    assert_eq!(result, TestResult::Success);
    assert_eq!(stats.labels(), vec![""]);
    assert_eq!(stats.values("").len(), 4);
    let summary = stats.summary("").unwrap();
    assert_eq!(summary.unit, MeasurementUnit::Microseconds);
    assert_eq!(summary.kind, MeasurementType::Cpu);
    assert!(!config.master_socket_path().exists());
}

#[test]
fn test_two_ranks_socket() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), Strategy::Socket, Path::new(WORKER));
    let stats = Statistics::new();

    let result = heat3d::run_master(&HostBackend::new(), &small([2, 1, 1]), &config, &stats).unwrap();
    assert_eq!(result, TestResult::Success);
    assert_eq!(
        stats.labels(),
        vec![heat3d::process_name(0), heat3d::process_name(1), String::new()]
    );
    for label in stats.labels() {
        assert_eq!(stats.values(&label).len(), 4, "{label}");
        let summary = stats.summary(&label).unwrap();
        assert_eq!(summary.unit, MeasurementUnit::Microseconds);
        assert_eq!(summary.kind, MeasurementType::Cpu);
    }
    assert!(!config.master_socket_path().exists());
    assert!(!config.rank_socket_path(0).exists());
    assert!(!config.rank_socket_path(1).exists());
}

#[test]
fn test_four_ranks_socket() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), Strategy::Socket, Path::new(WORKER));
    let stats = Statistics::new();

    let result = heat3d::run_master(&HostBackend::new(), &small([1, 2, 2]), &config, &stats).unwrap();
    assert_eq!(result, TestResult::Success);
    assert_eq!(stats.values(&heat3d::process_name(3)).len(), 4);
}

#[test]
fn test_two_ranks_pidfd() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), Strategy::Pidfd, Path::new(WORKER));
    let stats = Statistics::new();

    let result = heat3d::run_master(&HostBackend::new(), &small([2, 1, 1]), &config, &stats);
    match result {
        Ok(TestResult::Success) => assert_eq!(stats.values("").len(), 4),
        // pidfd_getfd missing or blocked by ptrace policy.
        Ok(TestResult::DeviceNotCapable) | Err(Error::Unsupported(_)) => {
            eprintln!("skipping: pidfd translation not permitted here");
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[test]
fn test_failing_workers_reported_over_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("not-capable-worker");
    std::fs::write(
        &script,
        format!("#!/bin/sh\nexit {}\n", TestResult::DeviceNotCapable.exit_code()),
    )
    .unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let config = Config::builder()
        .socket_dir(dir.path())
        .worker_exe(&script)
        .barrier_timeout(Duration::from_millis(500))
        .sync_timeout(Duration::from_millis(500))
        .accept_timeout(Duration::from_millis(500))
        .connect_timeout(Duration::from_millis(500))
        .build()
        .unwrap();
    let stats = Statistics::new();

    let result = heat3d::run_master(&HostBackend::new(), &small([2, 1, 1]), &config, &stats).unwrap();
    assert_eq!(result, TestResult::DeviceNotCapable);
    assert!(stats.is_empty());
}

#[test]
fn test_invalid_mesh_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), Strategy::Socket, Path::new(WORKER));
    let params = Heat3dParams {
        sub_domains: [4, 1, 1],
        mesh_length: 8,
        ..Default::default()
    };
    let err = heat3d::run_master(&HostBackend::new(), &params, &config, &Statistics::new()).unwrap_err();
    assert_eq!(TestResult::from(&err), TestResult::InvalidArgs);
}
