//! Neighbor discovery: every rank learns where to copy each of its six
//! halos.
//!
//! A rank's halo for facet `f` goes into the receive buffer its neighbor
//! across `f` keeps for `f.opposite()`. When that neighbor is the rank
//! itself the copy targets its own receive buffer and nothing is imported.

use super::topology::{slot_offset, Facet, RankGrid, SLOT_SIZE};
use crate::backend::ComputeBackend;
use crate::barrier::Participant;
use crate::config::{Config, Strategy};
use crate::error::{Error, Result};
use crate::ipc::{
    HandleExporter, HandleImporter, ImportedHandle, PidfdExporter, PidfdImporter, SharedHandle,
    SocketExporter, SocketImporter, HANDLE_SIZE,
};
use std::fmt;

/// Encoded size of a [`HaloBufferInfo`].
pub const HALO_INFO_SIZE: usize = 4 + HANDLE_SIZE;

const _: () = assert!(HALO_INFO_SIZE <= SLOT_SIZE);

/// A receive buffer published in the scratch buffer: the handle and the
/// process whose descriptor table it refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HaloBufferInfo {
    pub pid: libc::pid_t,
    pub handle: SharedHandle,
}

impl HaloBufferInfo {
    pub fn to_bytes(&self) -> [u8; HALO_INFO_SIZE] {
        let mut bytes = [0u8; HALO_INFO_SIZE];
        bytes[..4].copy_from_slice(&self.pid.to_le_bytes());
        bytes[4..].copy_from_slice(self.handle.as_bytes());
        bytes
    }

    /// Decodes a slot. An unwritten slot (pid 0) is a protocol error.
    pub fn from_bytes(bytes: &[u8; HALO_INFO_SIZE]) -> Result<Self> {
        let pid = libc::pid_t::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if pid <= 0 {
            return Err(Error::protocol(format!("halo slot holds no process (pid {pid})")));
        }
        let mut handle = [0u8; HANDLE_SIZE];
        handle.copy_from_slice(&bytes[4..]);
        Ok(Self {
            pid,
            handle: SharedHandle::from_bytes(handle),
        })
    }
}

pub fn write_halo_buffer_info<B: ComputeBackend>(
    backend: &B,
    scratch: &B::Buffer,
    rank: u32,
    facet: Facet,
    info: &HaloBufferInfo,
) -> Result<()> {
    backend.write(scratch, slot_offset(rank, facet), &info.to_bytes())
}

pub fn read_halo_buffer_info<B: ComputeBackend>(
    backend: &B,
    scratch: &B::Buffer,
    rank: u32,
    facet: Facet,
) -> Result<HaloBufferInfo> {
    let mut bytes = [0u8; HALO_INFO_SIZE];
    backend.read(scratch, slot_offset(rank, facet), &mut bytes)?;
    HaloBufferInfo::from_bytes(&bytes)
}

/// Destination of each of a rank's six halos.
pub struct HaloTargets<B: ComputeBackend> {
    imported: [Option<B::Buffer>; Facet::COUNT],
}

impl<B: ComputeBackend> fmt::Debug for HaloTargets<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let imported: Vec<bool> = self.imported.iter().map(Option::is_some).collect();
        f.debug_struct("HaloTargets").field("imported", &imported).finish()
    }
}

impl<B: ComputeBackend> HaloTargets<B> {
    /// Every neighbor is the rank itself.
    pub fn local() -> Self {
        Self {
            imported: std::array::from_fn(|_| None),
        }
    }

    /// The buffer the halo for `facet` is copied into; `recv` are the rank's
    /// own receive buffers in facet order.
    pub fn target<'a>(&'a self, facet: Facet, recv: &'a [B::Buffer]) -> &'a B::Buffer {
        match &self.imported[facet.index()] {
            Some(buffer) => buffer,
            None => &recv[facet.opposite().index()],
        }
    }

    pub fn is_imported(&self, facet: Facet) -> bool {
        self.imported[facet.index()].is_some()
    }

    pub fn imported_count(&self) -> usize {
        self.imported.iter().filter(|b| b.is_some()).count()
    }
}

/// Resolves the halo targets of `rank` with the configured strategy.
///
/// Passes the same barrier rounds the coordinator runs for the strategy:
/// two per rank for sockets, one for pidfd, none with a single rank.
pub fn exchange_halo_buffers<B: ComputeBackend>(
    backend: &B,
    config: &Config,
    participant: &mut Participant<'_, B>,
    grid: &RankGrid,
    recv: &[B::Buffer],
    scratch: &B::Buffer,
) -> Result<HaloTargets<B>> {
    if recv.len() != Facet::COUNT {
        return Err(Error::invalid_args(format!(
            "expected {} receive buffers, got {}",
            Facet::COUNT,
            recv.len()
        )));
    }
    if grid.n_ranks() == 1 {
        return Ok(HaloTargets::local());
    }

    let targets = match config.strategy {
        Strategy::Socket => exchange_over_sockets(backend, config, participant, grid, recv)?,
        Strategy::Pidfd => exchange_over_pidfd(backend, config, participant, grid, recv, scratch)?,
    };
    tracing::debug!(
        rank = participant.rank(),
        strategy = %config.strategy,
        imported = targets.imported_count(),
        "halo targets resolved"
    );
    Ok(targets)
}

fn export_all<B: ComputeBackend>(backend: &B, recv: &[B::Buffer]) -> Result<Vec<SharedHandle>> {
    recv.iter().map(|b| backend.export_buffer(b)).collect()
}

/// One round per rank `r`: after a barrier, `r` serves its receive-buffer
/// handles on its own socket and every other rank takes the ones it needs;
/// a second barrier closes the round.
fn exchange_over_sockets<B: ComputeBackend>(
    backend: &B,
    config: &Config,
    participant: &mut Participant<'_, B>,
    grid: &RankGrid,
    recv: &[B::Buffer],
) -> Result<HaloTargets<B>> {
    let rank = participant.rank();
    let n_ranks = grid.n_ranks();
    let neighbors = grid.neighbors(rank);
    let mut targets = HaloTargets::local();

    for server in 0..n_ranks {
        participant.arrive_and_wait(config.barrier_timeout)?;
        let path = config.rank_socket_path(server);

        if server == rank {
            let handles = export_all(backend, recv)?;
            SocketExporter::new(&path, n_ranks as usize - 1, config).export_handles(&handles)?;
        } else {
            let mut handles: Vec<Option<ImportedHandle>> = SocketImporter::new(&path, config)
                .import_handles(Facet::COUNT)?
                .into_iter()
                .map(Some)
                .collect();
            for facet in Facet::ALL {
                if neighbors[facet.index()] != server {
                    continue;
                }
                if let Some(handle) = handles[facet.opposite().index()].take() {
                    targets.imported[facet.index()] = Some(backend.import_buffer(handle)?);
                }
            }
        }

        participant.arrive_and_wait(config.barrier_timeout)?;
        tracing::trace!(rank, server, "socket exchange round done");
    }
    Ok(targets)
}

/// Every rank publishes its six receive buffers in its scratch slots, then
/// after one barrier pulls its neighbors' descriptors by pid.
fn exchange_over_pidfd<B: ComputeBackend>(
    backend: &B,
    config: &Config,
    participant: &mut Participant<'_, B>,
    grid: &RankGrid,
    recv: &[B::Buffer],
    scratch: &B::Buffer,
) -> Result<HaloTargets<B>> {
    let rank = participant.rank();
    let neighbors = grid.neighbors(rank);

    let handles = export_all(backend, recv)?;
    PidfdExporter.export_handles(&handles)?;
    let pid = std::process::id() as libc::pid_t;
    for (facet, handle) in Facet::ALL.into_iter().zip(handles) {
        write_halo_buffer_info(backend, scratch, rank, facet, &HaloBufferInfo { pid, handle })?;
    }
    backend.synchronize()?;

    participant.arrive_and_wait(config.barrier_timeout)?;

    let mut targets = HaloTargets::local();
    for facet in Facet::ALL {
        let neighbor = neighbors[facet.index()];
        if neighbor == rank {
            continue;
        }
        let info = read_halo_buffer_info(backend, scratch, neighbor, facet.opposite())?;
        let handle = PidfdImporter::new(info.pid, vec![info.handle])
            .import_handles(1)?
            .pop()
            .ok_or_else(|| Error::protocol("pidfd import returned no handle"))?;
        targets.imported[facet.index()] = Some(backend.import_buffer(handle)?);
    }
    Ok(targets)
}
