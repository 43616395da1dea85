use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How a descriptor behind a [`SharedHandle`](crate::ipc::SharedHandle)
/// reaches the importing process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Strategy {
    /// `SCM_RIGHTS` over a Unix-domain socket.
    #[default]
    Socket,
    /// `pidfd_getfd` against the exporter's pid.
    Pidfd,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::Socket => "socket",
            Strategy::Pidfd => "pidfd",
        }
    }
}

impl std::str::FromStr for Strategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "socket" => Ok(Strategy::Socket),
            "pidfd" => Ok(Strategy::Pidfd),
            other => Err(Error::config(format!("unknown strategy '{other}'"))),
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub strategy: Strategy,
    pub socket_dir: PathBuf,
    pub worker_exe: Option<PathBuf>,

    pub barrier_timeout: Duration,
    pub connect_timeout: Duration,
    pub accept_timeout: Duration,
    pub sync_timeout: Duration,
    pub process_timeout: Duration,
    pub connect_retry_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            socket_dir: PathBuf::from("/tmp"),
            worker_exe: None,

            barrier_timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(30),
            accept_timeout: Duration::from_secs(30),
            sync_timeout: Duration::from_secs(120),
            process_timeout: Duration::from_secs(600),
            connect_retry_interval: Duration::from_millis(10),
        }
    }
}

impl Config {
    pub const WORKER_EXE_NAME: &'static str = "mpbench-worker";

    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        let timeouts = [
            ("barrier_timeout", self.barrier_timeout),
            ("connect_timeout", self.connect_timeout),
            ("accept_timeout", self.accept_timeout),
            ("sync_timeout", self.sync_timeout),
            ("process_timeout", self.process_timeout),
        ];
        for (name, value) in timeouts {
            if value.is_zero() {
                return Err(Error::config(format!("{name} must be > 0")));
            }
        }

        if self.connect_retry_interval.is_zero() {
            return Err(Error::config("connect_retry_interval must be > 0"));
        }
        if self.connect_retry_interval > self.connect_timeout {
            return Err(Error::config(
                "connect_retry_interval must not exceed connect_timeout",
            ));
        }

        // sun_path is 108 bytes; leave room for "heat3d_<rank>.socket".
        if self.socket_dir.as_os_str().len() > 80 {
            return Err(Error::config("socket_dir too long for a unix socket path"));
        }

        Ok(())
    }

    /// Rendezvous path for the coordinator's initial handle handshake.
    pub fn master_socket_path(&self) -> PathBuf {
        self.socket_dir.join("heat3d.socket")
    }

    /// Transient path rank `rank` serves its receive-buffer handles on.
    pub fn rank_socket_path(&self, rank: u32) -> PathBuf {
        rank_socket_path(&self.socket_dir, rank)
    }

    /// The worker executable: configured explicitly, or `mpbench-worker`
    /// next to the running binary.
    pub fn worker_exe(&self) -> Result<PathBuf> {
        if let Some(exe) = &self.worker_exe {
            return Ok(exe.clone());
        }
        let current = std::env::current_exe()?;
        let dir = current
            .parent()
            .ok_or_else(|| Error::config("current executable has no parent directory"))?;
        Ok(dir.join(Self::WORKER_EXE_NAME))
    }
}

pub(crate) fn rank_socket_path(dir: &Path, rank: u32) -> PathBuf {
    dir.join(format!("heat3d_{rank}.socket"))
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    pub fn socket_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.config.socket_dir = dir.into();
        self
    }

    pub fn worker_exe<P: Into<PathBuf>>(mut self, exe: P) -> Self {
        self.config.worker_exe = Some(exe.into());
        self
    }

    pub fn barrier_timeout(mut self, timeout: Duration) -> Self {
        self.config.barrier_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn accept_timeout(mut self, timeout: Duration) -> Self {
        self.config.accept_timeout = timeout;
        self
    }

    pub fn sync_timeout(mut self, timeout: Duration) -> Self {
        self.config.sync_timeout = timeout;
        self
    }

    pub fn process_timeout(mut self, timeout: Duration) -> Self {
        self.config.process_timeout = timeout;
        self
    }

    pub fn connect_retry_interval(mut self, interval: Duration) -> Self {
        self.config.connect_retry_interval = interval;
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.strategy, Strategy::Socket);
        assert_eq!(config.master_socket_path(), PathBuf::from("/tmp/heat3d.socket"));
        assert_eq!(config.rank_socket_path(3), PathBuf::from("/tmp/heat3d_3.socket"));
    }

    #[test]
    fn test_builder_rejects_zero_timeout() {
        let result = Config::builder()
            .barrier_timeout(Duration::ZERO)
            .build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_builder_rejects_retry_longer_than_timeout() {
        let result = Config::builder()
            .connect_timeout(Duration::from_millis(5))
            .connect_retry_interval(Duration::from_millis(10))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!("pidfd".parse::<Strategy>().unwrap(), Strategy::Pidfd);
        assert_eq!("socket".parse::<Strategy>().unwrap(), Strategy::Socket);
        assert!("pipe".parse::<Strategy>().is_err());
        assert_eq!(Strategy::Pidfd.to_string(), "pidfd");
    }

    #[test]
    fn test_explicit_worker_exe() {
        let config = Config::builder()
            .worker_exe("/opt/bench/worker")
            .build()
            .unwrap();
        assert_eq!(config.worker_exe().unwrap(), PathBuf::from("/opt/bench/worker"));
    }
}
