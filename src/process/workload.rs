//! Worker-side half of the process protocol.
//!
//! A worker receives three descriptors from its coordinator: a pipe to read
//! synchronization bytes from, one to write them to, and one for its
//! measurements. Without them the worker runs standalone: synchronization
//! is a no-op and measurements go to stdout.

use super::child::{wait_readable, SYNC_CHAR};
use crate::error::{Error, Result};
use crate::result::TestResult;
use crate::stats::{MeasurementType, MeasurementUnit, StatisticsSink};
use crate::util::Deadline;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::time::Duration;

fn adopt_descriptor(fd: RawFd, what: &str) -> Result<File> {
    if fd < 0 {
        return Err(Error::invalid_args(format!("{what}: invalid descriptor {fd}")));
    }
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(Error::invalid_args(format!(
            "{what}: descriptor {fd} is not open in this process"
        )));
    }
    // Keep it out of anything this worker spawns.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(Error::last_os("fcntl(F_SETFD)"));
    }
    // The coordinator handed this descriptor to us alone and nothing else in
    // this process refers to it.
    Ok(unsafe { File::from_raw_fd(fd) })
}

#[derive(Debug, Default)]
pub struct WorkloadIo {
    sync_in: Option<File>,
    sync_out: Option<File>,
    measurements: Option<File>,
}

impl WorkloadIo {
    /// Adopts the descriptors named on the command line. The two
    /// synchronization pipes must be given together.
    pub fn from_args(
        sync_in: Option<RawFd>,
        sync_out: Option<RawFd>,
        measurements: Option<RawFd>,
    ) -> Result<Self> {
        if sync_in.is_some() != sync_out.is_some() {
            return Err(Error::invalid_args(
                "synchronization pipes must be passed together",
            ));
        }
        Ok(Self {
            sync_in: sync_in.map(|fd| adopt_descriptor(fd, "synchronizationPipeIn")).transpose()?,
            sync_out: sync_out.map(|fd| adopt_descriptor(fd, "synchronizationPipeOut")).transpose()?,
            measurements: measurements.map(|fd| adopt_descriptor(fd, "measurementPipe")).transpose()?,
        })
    }

    pub fn standalone() -> Self {
        Self::default()
    }

    pub fn is_standalone(&self) -> bool {
        self.sync_in.is_none()
    }

    pub fn write_sync_char(&mut self) -> Result<()> {
        if let Some(out) = &mut self.sync_out {
            out.write_all(&[SYNC_CHAR])
                .map_err(|e| Error::process(format!("writing synchronization byte failed: {e}")))?;
        }
        Ok(())
    }

    pub fn read_sync_char(&mut self, timeout: Duration) -> Result<()> {
        let Some(input) = &mut self.sync_in else {
            return Ok(());
        };
        let deadline = Deadline::after(timeout);
        wait_readable(input.as_raw_fd(), &deadline, "coordinator to synchronize")?;

        let mut byte = [0u8; 1];
        match input.read(&mut byte) {
            Ok(0) => Err(Error::process("coordinator closed the synchronization pipe")),
            Ok(_) if byte[0] != SYNC_CHAR => Err(Error::protocol(format!(
                "invalid synchronization byte {:#04x} from coordinator",
                byte[0]
            ))),
            Ok(_) => Ok(()),
            Err(e) => Err(Error::process(format!(
                "reading synchronization byte failed: {e}"
            ))),
        }
    }

    pub fn write_measurements(&mut self, text: &str) -> Result<()> {
        match &mut self.measurements {
            Some(pipe) => pipe
                .write_all(text.as_bytes())
                .map_err(|e| Error::process(format!("writing measurements failed: {e}"))),
            None => {
                println!("{text}");
                Ok(())
            }
        }
    }
}

/// Counts synchronization points so a failing worker can still complete the
/// number its coordinator expects.
#[derive(Debug)]
pub struct WorkloadSynchronization {
    expected: usize,
    performed: usize,
    enabled: bool,
    timeout: Duration,
}

impl WorkloadSynchronization {
    pub fn new(expected: usize, enabled: bool, timeout: Duration) -> Self {
        Self {
            expected,
            performed: 0,
            enabled,
            timeout,
        }
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn performed(&self) -> usize {
        self.performed
    }

    /// Tells the coordinator this worker reached the point, then waits to be
    /// let through.
    pub fn synchronize(&mut self, io: &mut WorkloadIo) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.performed >= self.expected {
            return Err(Error::protocol(format!(
                "synchronized more than the expected {} times",
                self.expected
            )));
        }
        io.write_sync_char()?;
        io.read_sync_char(self.timeout)?;
        self.performed += 1;
        Ok(())
    }

    pub fn validate(&self) -> bool {
        !self.enabled || self.performed == self.expected
    }

    /// Performs the synchronization points left after a failure. Stops at
    /// the first one that fails.
    pub fn execute_remaining(&mut self, io: &mut WorkloadIo) -> Result<()> {
        while self.enabled && self.performed < self.expected {
            self.synchronize(io)?;
        }
        Ok(())
    }
}

/// Fixed-capacity sink for a worker's per-iteration timings.
#[derive(Debug)]
pub struct WorkloadStatistics {
    capacity: usize,
    values: Mutex<Vec<u64>>,
}

impl WorkloadStatistics {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            values: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity
    }

    /// Space-separated nanoseconds, as the coordinator parses them.
    pub fn render(&self) -> String {
        let values = self.values.lock();
        let mut out = String::with_capacity(values.len() * 12);
        for value in values.iter() {
            out.push_str(&value.to_string());
            out.push(' ');
        }
        out
    }
}

impl StatisticsSink for WorkloadStatistics {
    fn push_value(
        &self,
        value: Duration,
        unit: MeasurementUnit,
        kind: MeasurementType,
        label: &str,
    ) -> Result<()> {
        if unit != MeasurementUnit::Unknown || kind != MeasurementType::Unknown {
            return Err(Error::protocol("worker statistics carry no unit or type"));
        }
        if !label.is_empty() {
            return Err(Error::protocol("worker statistics hold a single series"));
        }
        let mut values = self.values.lock();
        if values.len() == self.capacity {
            return Err(Error::protocol(format!(
                "more than {} values pushed",
                self.capacity
            )));
        }
        values.push(u64::try_from(value.as_nanos()).unwrap_or(u64::MAX));
        Ok(())
    }

    fn push_unit_and_type(&self, _unit: MeasurementUnit, _kind: MeasurementType) -> Result<()> {
        Ok(())
    }
}

/// What every workload receives from the harness.
#[derive(Debug)]
pub struct WorkloadContext<'a> {
    pub statistics: &'a WorkloadStatistics,
    pub synchronization: &'a mut WorkloadSynchronization,
    pub io: &'a mut WorkloadIo,
}

/// Descriptors and counts shared by every workload's command line.
#[derive(Debug, Clone, Default)]
pub struct WorkloadOptions {
    pub iterations: usize,
    pub sync_points: usize,
    pub synchronize: bool,
    pub sync_timeout: Duration,
    pub sync_pipe_in: Option<RawFd>,
    pub sync_pipe_out: Option<RawFd>,
    pub measurement_pipe: Option<RawFd>,
}

/// The descriptor arguments a coordinator appends to every worker command
/// line.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct WorkloadArgs {
    #[arg(long = super::ARG_SYNC_PIPE_IN)]
    pub sync_pipe_in: Option<RawFd>,

    #[arg(long = super::ARG_SYNC_PIPE_OUT)]
    pub sync_pipe_out: Option<RawFd>,

    #[arg(long = super::ARG_MEASUREMENT_PIPE)]
    pub measurement_pipe: Option<RawFd>,
}

impl WorkloadArgs {
    /// Options for a workload producing `iterations` values and passing
    /// `sync_points` synchronization points.
    pub fn options(&self, iterations: usize, sync_points: usize, sync_timeout: Duration) -> WorkloadOptions {
        WorkloadOptions {
            iterations,
            sync_points,
            synchronize: sync_points > 0,
            sync_timeout,
            sync_pipe_in: self.sync_pipe_in,
            sync_pipe_out: self.sync_pipe_out,
            measurement_pipe: self.measurement_pipe,
        }
    }
}

/// Runs `body` inside the worker protocol and returns the result to exit
/// with.
///
/// On success the measurements are written to the coordinator. On failure
/// the remaining synchronization points are still performed so the
/// coordinator's `synchronize_all` is not left waiting.
pub fn run_workload<F>(options: &WorkloadOptions, body: F) -> TestResult
where
    F: FnOnce(&mut WorkloadContext<'_>) -> Result<TestResult>,
{
    let mut io = match WorkloadIo::from_args(
        options.sync_pipe_in,
        options.sync_pipe_out,
        options.measurement_pipe,
    ) {
        Ok(io) => io,
        Err(e) => {
            tracing::error!(error = %e, "cannot set up workload pipes");
            return TestResult::from(&e);
        }
    };
    let statistics = WorkloadStatistics::new(options.iterations);
    let mut synchronization = WorkloadSynchronization::new(
        options.sync_points,
        options.synchronize,
        options.sync_timeout,
    );

    let mut context = WorkloadContext {
        statistics: &statistics,
        synchronization: &mut synchronization,
        io: &mut io,
    };
    let result = match body(&mut context) {
        Ok(result) => result,
        Err(e) => {
            tracing::error!(error = %e, "workload failed");
            TestResult::from(&e)
        }
    };

    if result.is_success() {
        if !statistics.is_full() {
            tracing::warn!(
                pushed = statistics.len(),
                expected = options.iterations,
                "workload did not produce the expected number of values"
            );
        }
        if !synchronization.validate() {
            tracing::warn!(
                performed = synchronization.performed(),
                expected = synchronization.expected(),
                "workload did not synchronize the expected number of times"
            );
        }
        if let Err(e) = io.write_measurements(&statistics.render()) {
            tracing::error!(error = %e, "cannot report measurements");
            return TestResult::Error;
        }
    } else if let Err(e) = synchronization.execute_remaining(&mut io) {
        tracing::warn!(error = %e, "remaining synchronizations not completed");
    }
    result
}
