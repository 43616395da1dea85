//! Benchmark parameters and the worker command line.

use super::topology::{RankGrid, SubDomain};
use crate::config::{Config, Strategy};
use crate::error::{Error, Result};
use crate::ipc::SharedHandle;
use crate::process::{Process, WorkloadArgs};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Worker argument names, shared by the coordinator that renders them and
/// the worker that parses them.
pub mod keys {
    pub const RANK: &str = "rank";
    pub const PARENT_PID: &str = "parentPid";
    pub const N_SUB_DOMAIN_X: &str = "nSubDomainX";
    pub const N_SUB_DOMAIN_Y: &str = "nSubDomainY";
    pub const N_SUB_DOMAIN_Z: &str = "nSubDomainZ";
    pub const N_TIMESTEPS: &str = "nTimesteps";
    pub const MESH_LENGTH: &str = "meshLength";
    pub const ITERATIONS: &str = "iterations";
    pub const STRATEGY: &str = "strategy";
    pub const SOCKET_PATH: &str = "socketPath";
    pub const INIT_BUFFER_IPC_HANDLE: &str = "initBufferIpcHandle";
    pub const EV_POOL_IPC_HANDLE: &str = "evPoolIpcHandle";
    pub const BARRIER_TIMEOUT_MS: &str = "barrierTimeoutMs";
}

/// Problem size and repetition counts, identical on every rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heat3dParams {
    pub sub_domains: [u32; 3],
    pub mesh_length: u32,
    pub n_timesteps: u32,
    pub iterations: usize,
}

impl Default for Heat3dParams {
    fn default() -> Self {
        Self {
            sub_domains: [1, 1, 1],
            mesh_length: 64,
            n_timesteps: 10,
            iterations: 10,
        }
    }
}

impl Heat3dParams {
    pub fn grid(&self) -> Result<RankGrid> {
        let [x, y, z] = self.sub_domains;
        RankGrid::new(x, y, z)
    }

    /// Checks the parameters and returns the per-rank block they produce.
    pub fn validate(&self) -> Result<(RankGrid, SubDomain)> {
        if self.iterations == 0 {
            return Err(Error::invalid_args("iterations must be positive"));
        }
        if self.n_timesteps == 0 {
            return Err(Error::invalid_args("nTimesteps must be positive"));
        }
        let grid = self.grid()?;
        let sub = SubDomain::split(self.mesh_length, &grid)?;
        Ok((grid, sub))
    }

    /// Grid spacing of the unit cube.
    pub fn delta_space(&self) -> f32 {
        1.0 / self.mesh_length as f32
    }

    /// Stencil weight `k * dt / ds^2` for the largest stable time step.
    pub fn weight(&self) -> f32 {
        const DIFFUSIVITY: f32 = 1.0;
        let ds = self.delta_space();
        let dt = ds * ds / (8.1 * DIFFUSIVITY);
        DIFFUSIVITY * dt / (ds * ds)
    }
}

/// Command line of one heat3d worker.
#[derive(Debug, Clone, clap::Args)]
pub struct Heat3dArgs {
    #[arg(long = keys::RANK)]
    pub rank: u32,

    #[arg(long = keys::PARENT_PID)]
    pub parent_pid: i32,

    #[arg(long = keys::N_SUB_DOMAIN_X, default_value_t = 1)]
    pub n_sub_domain_x: u32,

    #[arg(long = keys::N_SUB_DOMAIN_Y, default_value_t = 1)]
    pub n_sub_domain_y: u32,

    #[arg(long = keys::N_SUB_DOMAIN_Z, default_value_t = 1)]
    pub n_sub_domain_z: u32,

    #[arg(long = keys::N_TIMESTEPS, default_value_t = 10)]
    pub n_timesteps: u32,

    #[arg(long = keys::MESH_LENGTH, default_value_t = 64)]
    pub mesh_length: u32,

    #[arg(long = keys::ITERATIONS, default_value_t = 10)]
    pub iterations: usize,

    #[arg(long = keys::STRATEGY, default_value_t = Strategy::Socket)]
    pub strategy: Strategy,

    /// Coordinator handshake socket; rank sockets live next to it.
    #[arg(long = keys::SOCKET_PATH, default_value = "/tmp/heat3d.socket")]
    pub socket_path: PathBuf,

    #[arg(long = keys::INIT_BUFFER_IPC_HANDLE)]
    pub init_buffer_ipc_handle: Option<String>,

    #[arg(long = keys::EV_POOL_IPC_HANDLE)]
    pub ev_pool_ipc_handle: Option<String>,

    #[arg(long = keys::BARRIER_TIMEOUT_MS, default_value_t = 120_000)]
    pub barrier_timeout_ms: u64,

    #[command(flatten)]
    pub workload: WorkloadArgs,
}

impl Heat3dArgs {
    pub fn params(&self) -> Heat3dParams {
        Heat3dParams {
            sub_domains: [self.n_sub_domain_x, self.n_sub_domain_y, self.n_sub_domain_z],
            mesh_length: self.mesh_length,
            n_timesteps: self.n_timesteps,
            iterations: self.iterations,
        }
    }

    pub fn barrier_timeout(&self) -> Duration {
        Duration::from_millis(self.barrier_timeout_ms)
    }

    pub fn socket_dir(&self) -> &Path {
        self.socket_path.parent().unwrap_or_else(|| Path::new("/tmp"))
    }

    /// Worker-side configuration. Every wait is bounded by the barrier
    /// timeout the coordinator passed down.
    pub fn config(&self) -> Result<Config> {
        let timeout = self.barrier_timeout();
        Config::builder()
            .strategy(self.strategy)
            .socket_dir(self.socket_dir())
            .barrier_timeout(timeout)
            .connect_timeout(timeout)
            .accept_timeout(timeout)
            .sync_timeout(timeout)
            .connect_retry_interval(timeout.min(Duration::from_millis(10)))
            .build()
    }

    /// The scratch buffer and event pool handles published on the command
    /// line, required by the pidfd strategy.
    pub fn published_handles(&self) -> Result<[SharedHandle; 2]> {
        let decode = |value: &Option<String>, key: &str| {
            value
                .as_deref()
                .ok_or_else(|| Error::invalid_args(format!("--{key} is required with the pidfd strategy")))
                .and_then(SharedHandle::from_hex)
        };
        Ok([
            decode(&self.init_buffer_ipc_handle, keys::INIT_BUFFER_IPC_HANDLE)?,
            decode(&self.ev_pool_ipc_handle, keys::EV_POOL_IPC_HANDLE)?,
        ])
    }
}

/// Renders the arguments every worker shares onto `process`.
pub(crate) fn add_common_arguments(process: &mut Process, params: &Heat3dParams, config: &Config) {
    let [x, y, z] = params.sub_domains;
    process.add_argument(keys::PARENT_PID, std::process::id().to_string());
    process.add_argument(keys::N_SUB_DOMAIN_X, x.to_string());
    process.add_argument(keys::N_SUB_DOMAIN_Y, y.to_string());
    process.add_argument(keys::N_SUB_DOMAIN_Z, z.to_string());
    process.add_argument(keys::N_TIMESTEPS, params.n_timesteps.to_string());
    process.add_argument(keys::MESH_LENGTH, params.mesh_length.to_string());
    process.add_argument(keys::ITERATIONS, params.iterations.to_string());
    process.add_argument(keys::STRATEGY, config.strategy.as_str());
    process.add_argument(
        keys::SOCKET_PATH,
        config.master_socket_path().to_string_lossy(),
    );
    process.add_argument(
        keys::BARRIER_TIMEOUT_MS,
        config.barrier_timeout.as_millis().to_string(),
    );
}
