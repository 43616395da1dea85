//! Distributed 3D heat-equation halo exchange.
//!
//! The unit cube is split into `nSubDomainX * nSubDomainY * nSubDomainZ`
//! blocks, one per worker process. Every timestep each worker updates the
//! points next to its six faces, copies those faces straight into its
//! neighbors' receive buffers, updates its interior, and meets the others at
//! a barrier driven by the coordinator before pulling the received faces
//! into its ghost layer. Only the timestep loop is timed.

pub mod args;
pub mod exchange;
pub mod master;
pub mod stencil;
pub mod topology;
pub mod worker;

pub use args::{Heat3dArgs, Heat3dParams};
pub use exchange::{exchange_halo_buffers, HaloBufferInfo, HaloTargets};
pub use master::{process_name, run_master};
pub use stencil::StencilKernels;
pub use topology::{Facet, RankGrid, SubDomain};
pub use worker::run_worker;

use crate::backend::Capabilities;
use crate::error::{Error, Result};
use std::fmt;

/// Worker subcommand that runs one heat3d rank.
pub const WORKER_SUBCOMMAND: &str = "heat3d";

/// Stages every rank goes through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Scratch buffer and event pool are being handed out.
    AwaitHandshake,
    /// Ranks are swapping receive-buffer handles.
    InitBarrier,
    SteadyStateCompute,
    /// Results are collected and resources released.
    Drain,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::AwaitHandshake => "await-handshake",
            Phase::InitBarrier => "init-barrier",
            Phase::SteadyStateCompute => "steady-state-compute",
            Phase::Drain => "drain",
        };
        f.write_str(s)
    }
}

/// Both sides need cross-process memory and events, on a device that is
/// not split into tiles.
pub(crate) fn check_capabilities(capabilities: &Capabilities) -> Result<()> {
    if !capabilities.supports_ipc() {
        return Err(Error::DeviceNotCapable(format!(
            "{} backend cannot share memory and events between processes",
            capabilities.name
        )));
    }
    if capabilities.sub_devices > 1 {
        return Err(Error::DeviceNotCapable(format!(
            "device has {} sub-devices, heat3d runs on a single tile",
            capabilities.sub_devices
        )));
    }
    Ok(())
}
