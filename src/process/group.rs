//! A fixed set of worker processes launched and supervised together.

use super::child::Process;
use crate::error::{Error, Result};
use crate::result::TestResult;
use crate::stats::{MeasurementType, MeasurementUnit, StatisticsSink};
use crate::util::{Deadline, ReleaseGate};
use parking_lot::Mutex;
use std::ops::{Index, IndexMut};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

#[derive(Debug)]
pub struct ProcessGroup {
    binary: PathBuf,
    processes: Vec<Process>,
}

impl ProcessGroup {
    /// `count` processes of `binary`, named `rank0`, `rank1`, ...
    pub fn new<P: AsRef<Path>>(binary: P, count: usize) -> Self {
        let binary = binary.as_ref().to_path_buf();
        let processes = (0..count)
            .map(|rank| {
                let mut process = Process::new(&binary);
                process.set_name(format!("rank{rank}"));
                process
            })
            .collect();
        Self { binary, processes }
    }

    /// Runs `subcommand` of a worker executable that hosts several
    /// workloads.
    pub fn with_subcommand<S: AsRef<str>>(mut self, subcommand: S) -> Self {
        for process in &mut self.processes {
            process.set_subcommand(subcommand.as_ref());
        }
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Process> {
        self.processes.iter()
    }

    pub fn add_argument_all<K: AsRef<str>, V: AsRef<str>>(&mut self, key: K, value: V) {
        for process in &mut self.processes {
            process.add_argument(key.as_ref(), value.as_ref());
        }
    }

    pub fn add_env_all<K: AsRef<str>, V: AsRef<str>>(&mut self, key: K, value: V) {
        for process in &mut self.processes {
            process.add_env(key.as_ref(), value.as_ref());
        }
    }

    /// Spawns every process concurrently.
    ///
    /// One spawner thread per process is parked behind a closed gate until
    /// all of them exist, then they are released together. If any spawn
    /// fails the ones that did start are killed and the first error is
    /// returned.
    pub fn run_all(&mut self) -> Result<()> {
        let gate = ReleaseGate::new();
        let failures = Mutex::new(Vec::new());

        let spawned = thread::scope(|scope| -> Result<()> {
            let closed = gate.close();
            for (rank, process) in self.processes.iter_mut().enumerate() {
                let gate = &gate;
                let failures = &failures;
                thread::Builder::new()
                    .name(format!("spawn-{rank}"))
                    .spawn_scoped(scope, move || {
                        gate.pass();
                        if let Err(e) = process.run() {
                            failures.lock().push((rank, e));
                        }
                    })
                    .map_err(|e| Error::process(format!("spawner thread failed: {e}")))?;
            }
            closed.open();
            Ok(())
        });
        if let Err(e) = spawned {
            self.kill_all();
            return Err(e);
        }

        let mut failures = failures.into_inner();
        if failures.is_empty() {
            tracing::debug!(count = self.processes.len(), "process group started");
            return Ok(());
        }

        failures.sort_by_key(|(rank, _)| *rank);
        self.kill_all();
        let (rank, err) = failures.remove(0);
        tracing::warn!(rank, error = %err, "process group failed to start");
        Err(err)
    }

    /// `points` rounds of: read a sync byte from every process, then write
    /// one to every process. `timeout` bounds each read.
    pub fn synchronize_all(&mut self, points: usize, timeout: Duration) -> Result<()> {
        for _ in 0..points {
            for process in &mut self.processes {
                process.synchronization_wait(timeout)?;
            }
            for process in &mut self.processes {
                process.synchronization_signal()?;
            }
        }
        Ok(())
    }

    /// Waits for every process to exit. When `timeout` passes first the
    /// survivors are killed and `Error::Timeout` is returned.
    pub fn wait_for_finish_all(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Deadline::after(timeout);
        for index in 0..self.processes.len() {
            if let Err(e) = self.processes[index].wait_for_finish(deadline.remaining()) {
                tracing::warn!(
                    name = self.processes[index].name(),
                    error = %e,
                    "killing remaining processes"
                );
                self.kill_all();
                return Err(match e {
                    Error::Timeout(..) => Error::timeout(timeout, "process group to exit"),
                    other => other,
                });
            }
        }
        Ok(())
    }

    pub fn kill_all(&mut self) {
        for process in &mut self.processes {
            process.kill();
        }
    }

    /// The first non-success result in rank order. A process that never ran
    /// or has not finished counts as `Error`.
    pub fn result_all(&self) -> TestResult {
        TestResult::first_failure(
            self.processes
                .iter()
                .map(|p| p.result().unwrap_or(TestResult::Error)),
        )
    }

    /// Pushes every process's measurements into `sink`.
    ///
    /// With `per_process` each value goes in under the process name; with
    /// `averaged` the per-iteration mean across processes goes in
    /// unlabelled. Nothing is pushed if any process failed; its result is
    /// returned instead.
    pub fn push_measurements_to_statistics<S: StatisticsSink + ?Sized>(
        &self,
        expected: usize,
        sink: &S,
        unit: MeasurementUnit,
        kind: MeasurementType,
        per_process: bool,
        averaged: bool,
    ) -> Result<TestResult> {
        let result = self.result_all();
        if !result.is_success() {
            return Ok(result);
        }
        if self.processes.is_empty() {
            return Ok(TestResult::Success);
        }

        let all = self
            .processes
            .iter()
            .map(|p| p.measurements(expected))
            .collect::<Result<Vec<_>>>()?;

        if per_process {
            for (process, values) in self.processes.iter().zip(&all) {
                for value in values {
                    sink.push_value(Duration::from_nanos(*value), unit, kind, process.name())?;
                }
            }
        }

        if averaged {
            let count = all.len() as u128;
            for iteration in 0..expected {
                let sum: u128 = all.iter().map(|values| values[iteration] as u128).sum();
                let mean = (sum / count) as u64;
                sink.push_value(Duration::from_nanos(mean), unit, kind, "")?;
            }
        }

        Ok(TestResult::Success)
    }
}

impl Index<usize> for ProcessGroup {
    type Output = Process;

    fn index(&self, index: usize) -> &Process {
        &self.processes[index]
    }
}

impl IndexMut<usize> for ProcessGroup {
    fn index_mut(&mut self, index: usize) -> &mut Process {
        &mut self.processes[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::Statistics;

    #[test]
    fn test_names_and_arguments() {
        let mut group = ProcessGroup::new("/bin/true", 3).with_subcommand("probe");
        group.add_argument_all("iterations", "4");
        group[1].add_argument("rank", "1");
        group[2].set_name("last");

        assert_eq!(group.len(), 3);
        assert_eq!(group[0].name(), "rank0");
        assert_eq!(group[2].name(), "last");
        assert_eq!(
            group[1].arguments().collect::<Vec<_>>(),
            vec!["--iterations=4", "--rank=1"]
        );
    }

    #[test]
    fn test_unstarted_group_reports_error() {
        let group = ProcessGroup::new("/bin/true", 2);
        assert_eq!(group.result_all(), TestResult::Error);

        let stats = Statistics::new();
        let result = group
            .push_measurements_to_statistics(
                1,
                &stats,
                MeasurementUnit::Unknown,
                MeasurementType::Unknown,
                true,
                true,
            )
            .unwrap();
        assert_eq!(result, TestResult::Error);
        assert!(stats.is_empty());
    }

    #[test]
    fn test_run_and_wait_true_and_false() {
        let mut group = ProcessGroup::new("/bin/true", 2);
        group.run_all().unwrap();
        group.wait_for_finish_all(Duration::from_secs(10)).unwrap();
        assert_eq!(group.result_all(), TestResult::Success);

        let mut group = ProcessGroup::new("/bin/false", 2);
        group.run_all().unwrap();
        group.wait_for_finish_all(Duration::from_secs(10)).unwrap();
        assert_eq!(group.result_all(), TestResult::Error);
    }

    #[test]
    fn test_spawn_failure_fails_group() {
        let mut group = ProcessGroup::new("/nonexistent/mpbench-worker", 3);
        let err = group.run_all().unwrap_err();
        assert!(matches!(err, Error::Process(_)));
        assert!(group.iter().all(|p| !p.is_running()));
    }
}
