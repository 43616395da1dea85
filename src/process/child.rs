//! One spawned worker process and its private pipes.

use crate::error::{Error, Result};
use crate::result::TestResult;
use crate::util::{Backoff, Deadline};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

/// Byte exchanged on the synchronization pipes.
pub const SYNC_CHAR: u8 = b's';

pub const ARG_SYNC_PIPE_IN: &str = "synchronizationPipeIn";
pub const ARG_SYNC_PIPE_OUT: &str = "synchronizationPipeOut";
pub const ARG_MEASUREMENT_PIPE: &str = "measurementPipe";

/// Both ends of a close-on-exec pipe.
pub(crate) fn pipe() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(Error::last_os("pipe2"));
    }
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(Error::last_os("fcntl(O_NONBLOCK)"));
    }
    Ok(())
}

/// Blocks until `fd` is readable or the deadline passes.
pub(crate) fn wait_readable(fd: RawFd, deadline: &Deadline, what: &str) -> Result<()> {
    loop {
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, deadline.poll_millis()) };
        if rc < 0 {
            if io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(Error::last_os("poll"));
        }
        if rc == 0 {
            return Err(Error::timeout(deadline.timeout(), what.to_string()));
        }
        // POLLHUP still means a read will return (EOF), which the caller reports.
        return Ok(());
    }
}

#[derive(Debug)]
struct Running {
    child: Child,
    sync_to_child: File,
    sync_from_child: File,
    measurements: File,
    collected: Vec<u8>,
}

impl Running {
    /// Reads whatever the child has written so far without blocking.
    /// Returns true once the write end is closed.
    fn drain_measurements(&mut self) -> Result<bool> {
        let mut buf = [0u8; 1024];
        loop {
            match self.measurements.read(&mut buf) {
                Ok(0) => return Ok(true),
                Ok(n) => self.collected.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::process(format!("reading measurements failed: {e}"))),
            }
        }
    }
}

/// A child process description, spawned at most once.
#[derive(Debug)]
pub struct Process {
    exe: PathBuf,
    subcommand: Option<String>,
    name: String,
    arguments: Vec<(String, String)>,
    env: Vec<(String, String)>,
    running: Option<Running>,
    pid: Option<libc::pid_t>,
    result: Option<TestResult>,
    measurements: Option<String>,
}

impl Process {
    pub fn new<P: Into<PathBuf>>(exe: P) -> Self {
        Self {
            exe: exe.into(),
            subcommand: None,
            name: String::new(),
            arguments: Vec::new(),
            env: Vec::new(),
            running: None,
            pid: None,
            result: None,
            measurements: None,
        }
    }

    pub fn exe(&self) -> &Path {
        &self.exe
    }

    pub fn set_subcommand<S: Into<String>>(&mut self, subcommand: S) {
        self.subcommand = Some(subcommand.into());
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name<S: Into<String>>(&mut self, name: S) {
        self.name = name.into();
    }

    /// Passed as `--key=value`, or `--key` when `value` is empty. A repeated
    /// key replaces the earlier value.
    pub fn add_argument<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        let key = key.into();
        let value = value.into();
        match self.arguments.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.arguments.push((key, value)),
        }
    }

    pub fn add_env<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.env.push((key.into(), value.into()));
    }

    pub fn arguments(&self) -> impl Iterator<Item = String> + '_ {
        self.arguments.iter().map(|(k, v)| {
            if v.is_empty() {
                format!("--{k}")
            } else {
                format!("--{k}={v}")
            }
        })
    }

    pub fn pid(&self) -> Option<libc::pid_t> {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn result(&self) -> Option<TestResult> {
        self.result
    }

    /// Spawns the process with its three pipe ends.
    ///
    /// All pipes are created close-on-exec; only this child clears the flag
    /// on its own ends, so processes spawned concurrently never inherit each
    /// other's pipes.
    pub fn run(&mut self) -> Result<()> {
        if self.pid.is_some() {
            return Err(Error::process(format!("process {:?} already started", self.name)));
        }

        let (child_in, parent_out) = pipe()?;
        let (parent_in, child_out) = pipe()?;
        let (measurements_in, child_measurements) = pipe()?;
        set_nonblocking(measurements_in.as_raw_fd())?;

        let inherited = [
            child_in.as_raw_fd(),
            child_out.as_raw_fd(),
            child_measurements.as_raw_fd(),
        ];

        let mut command = Command::new(&self.exe);
        if let Some(subcommand) = &self.subcommand {
            command.arg(subcommand);
        }
        command
            .args(self.arguments())
            .arg(format!("--{ARG_SYNC_PIPE_IN}={}", inherited[0]))
            .arg(format!("--{ARG_SYNC_PIPE_OUT}={}", inherited[1]))
            .arg(format!("--{ARG_MEASUREMENT_PIPE}={}", inherited[2]))
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null());

        unsafe {
            command.pre_exec(move || {
                for fd in inherited {
                    let flags = libc::fcntl(fd, libc::F_GETFD);
                    if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }

        let child = command.spawn().map_err(|e| {
            Error::process(format!("spawning {} failed: {e}", self.exe.display()))
        })?;
        let pid = child.id() as libc::pid_t;
        tracing::debug!(name = %self.name, pid, "process started");

        // The child's ends close here; only the child holds them now.
        drop((child_in, child_out, child_measurements));

        self.pid = Some(pid);
        self.running = Some(Running {
            child,
            sync_to_child: File::from(parent_out),
            sync_from_child: File::from(parent_in),
            measurements: File::from(measurements_in),
            collected: Vec::new(),
        });
        Ok(())
    }

    fn running_mut(&mut self) -> Result<&mut Running> {
        let name = &self.name;
        self.running
            .as_mut()
            .ok_or_else(|| Error::process(format!("process {name:?} is not running")))
    }

    /// Reads one synchronization byte from the child.
    pub fn synchronization_wait(&mut self, timeout: Duration) -> Result<()> {
        let name = self.name.clone();
        let running = self.running_mut()?;
        let deadline = Deadline::after(timeout);
        wait_readable(
            running.sync_from_child.as_raw_fd(),
            &deadline,
            &format!("{name} to synchronize"),
        )?;

        let mut byte = [0u8; 1];
        match running.sync_from_child.read(&mut byte) {
            Ok(0) => Err(Error::process(format!("{name} exited before synchronizing"))),
            Ok(_) if byte[0] != SYNC_CHAR => Err(Error::protocol(format!(
                "{name} sent synchronization byte {:#04x}",
                byte[0]
            ))),
            Ok(_) => Ok(()),
            Err(e) => Err(Error::process(format!("reading from {name} failed: {e}"))),
        }
    }

    /// Writes one synchronization byte to the child.
    pub fn synchronization_signal(&mut self) -> Result<()> {
        let name = self.name.clone();
        let running = self.running_mut()?;
        running
            .sync_to_child
            .write_all(&[SYNC_CHAR])
            .map_err(|e| Error::process(format!("signalling {name} failed: {e}")))
    }

    /// Waits for the child to exit and records its result. Measurements are
    /// drained while waiting so a chatty child never blocks on a full pipe.
    pub fn wait_for_finish(&mut self, timeout: Duration) -> Result<TestResult> {
        if let Some(result) = self.result {
            return Ok(result);
        }
        let name = self.name.clone();
        let running = self.running_mut()?;
        let deadline = Deadline::after(timeout);
        let mut backoff = Backoff::with_max_sleep(Duration::from_millis(5));

        let status = loop {
            running.drain_measurements()?;
            if let Some(status) = running.child.try_wait()? {
                break status;
            }
            if deadline.expired() {
                return Err(Error::timeout(timeout, format!("{name} to exit")));
            }
            backoff.snooze();
        };

        // The write end may linger briefly in a grandchild; stop at EOF or
        // when nothing more is buffered.
        running.drain_measurements()?;

        let result = match status.code() {
            Some(code) => TestResult::from_exit_code(code),
            None => {
                tracing::warn!(
                    name = %name,
                    signal = status.signal(),
                    "process killed by signal"
                );
                TestResult::Error
            }
        };
        tracing::debug!(name = %name, %result, "process finished");

        if let Some(running) = self.running.take() {
            self.measurements = Some(String::from_utf8_lossy(&running.collected).into_owned());
        }
        self.result = Some(result);
        Ok(result)
    }

    /// Kills the child if it is still running and reaps it.
    pub fn kill(&mut self) {
        if let Some(mut running) = self.running.take() {
            let _ = running.child.kill();
            let _ = running.child.wait();
            tracing::debug!(name = %self.name, "process killed");
            self.result = Some(TestResult::Error);
            self.measurements = Some(String::new());
        }
    }

    /// Whitespace-separated nanosecond values written by the child.
    /// Exactly `expected` values must be present.
    pub fn measurements(&self, expected: usize) -> Result<Vec<u64>> {
        let raw = self.measurements.as_deref().ok_or_else(|| {
            Error::process(format!("process {:?} has not finished", self.name))
        })?;
        let values = raw
            .split_whitespace()
            .map(|token| {
                token.parse::<u64>().map_err(|_| {
                    Error::protocol(format!("{} sent malformed measurement {token:?}", self.name))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if values.len() != expected {
            return Err(Error::protocol(format!(
                "{} sent {} measurements, expected {expected}",
                self.name,
                values.len()
            )));
        }
        Ok(values)
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        self.kill();
    }
}
