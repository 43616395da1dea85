//! Compute backend abstraction.
//!
//! The IPC protocols only need a handful of device operations: allocate
//! memory, export it as a [`SharedHandle`], map somebody else's export,
//! create events out of a shareable pool, and copy bytes. Anything that can
//! do that can drive the barrier and the halo exchange.

pub mod host;
pub mod shm;

use crate::error::Result;
use crate::ipc::{ImportedHandle, SharedHandle};
use std::time::Duration;

pub use host::{HostBackend, HostBuffer, HostEvent, HostEventPool};
pub use shm::SharedRegion;

/// What a backend instance can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub name: &'static str,
    /// Memory allocations can be exported to other processes.
    pub ipc_memory: bool,
    /// Event pools can be exported to other processes.
    pub ipc_events: bool,
    /// Number of sub-devices (tiles) behind the device.
    pub sub_devices: u32,
}

impl Capabilities {
    pub fn supports_ipc(&self) -> bool {
        self.ipc_memory && self.ipc_events
    }
}

pub trait ComputeBackend: Send + Sync {
    type Buffer: Send + Sync;
    type EventPool: Send + Sync;
    type Event: Send + Sync;

    fn capabilities(&self) -> Capabilities;

    /// Device memory, exportable when the backend supports IPC.
    fn allocate_device(&self, size: usize) -> Result<Self::Buffer>;

    /// Host memory private to this process.
    fn allocate_host(&self, size: usize) -> Result<Self::Buffer>;

    fn buffer_len(&self, buffer: &Self::Buffer) -> usize;

    fn export_buffer(&self, buffer: &Self::Buffer) -> Result<SharedHandle>;

    /// Maps an exported allocation. The import is independent of the export:
    /// dropping it never frees the exporter's memory.
    fn import_buffer(&self, handle: ImportedHandle) -> Result<Self::Buffer>;

    fn create_event_pool(&self, count: u32) -> Result<Self::EventPool>;

    fn event_pool_len(&self, pool: &Self::EventPool) -> u32;

    fn export_event_pool(&self, pool: &Self::EventPool) -> Result<SharedHandle>;

    fn import_event_pool(&self, handle: ImportedHandle) -> Result<Self::EventPool>;

    /// The event at `index` of `pool`, in its current state.
    fn create_event(&self, pool: &Self::EventPool, index: u32) -> Result<Self::Event>;

    /// Host signal. Signalling an event that is already signalled is an
    /// error.
    fn signal(&self, event: &Self::Event) -> Result<()>;

    /// Host wait until signalled, bounded by `timeout`.
    fn wait(&self, event: &Self::Event, timeout: Duration) -> Result<()>;

    fn reset(&self, event: &Self::Event) -> Result<()>;

    fn is_signaled(&self, event: &Self::Event) -> Result<bool>;

    /// Copies `len` bytes between allocations, possibly imported ones.
    fn copy(
        &self,
        dst: &Self::Buffer,
        dst_offset: usize,
        src: &Self::Buffer,
        src_offset: usize,
        len: usize,
    ) -> Result<()>;

    fn write(&self, dst: &Self::Buffer, offset: usize, bytes: &[u8]) -> Result<()>;

    fn read(&self, src: &Self::Buffer, offset: usize, out: &mut [u8]) -> Result<()>;

    /// Blocks until all previously issued work is complete and visible.
    fn synchronize(&self) -> Result<()>;
}
