//! Host backend: "device" memory is a shared `memfd` mapping and events are
//! atomic words in a shared pool.
//!
//! Handle layout (little endian):
//!
//! | bytes    | contents                              |
//! |----------|---------------------------------------|
//! | `0..4`   | exporter-local descriptor             |
//! | `4..8`   | kind tag, `MPBM` memory / `MPBE` pool |
//! | `8..16`  | size in bytes                         |
//! | `16..20` | event count (pools only)              |

use super::shm::SharedRegion;
use super::{Capabilities, ComputeBackend};
use crate::error::{Error, Result};
use crate::ipc::{ImportedHandle, SharedHandle};
use crate::util::{Backoff, Deadline};
use std::os::fd::AsRawFd;
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const MEMORY_TAG: [u8; 4] = *b"MPBM";
const POOL_TAG: [u8; 4] = *b"MPBE";

/// Bytes per event slot; one cache line so ranks polling neighbouring events
/// do not contend.
pub const EVENT_STRIDE: usize = 64;

const EVENT_RESET: u32 = 0;
const EVENT_SIGNALED: u32 = 1;

static ALLOCATIONS: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct HostBackend {
    capabilities: Capabilities,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Device,
    Host,
    Imported,
}

#[derive(Debug, Clone)]
pub struct HostBuffer {
    region: Arc<SharedRegion>,
    origin: Origin,
}

impl HostBuffer {
    pub(crate) fn region(&self) -> &SharedRegion {
        &self.region
    }

    pub fn is_imported(&self) -> bool {
        self.origin == Origin::Imported
    }
}

#[derive(Debug, Clone)]
pub struct HostEventPool {
    region: Arc<SharedRegion>,
    count: u32,
}

#[derive(Debug, Clone)]
pub struct HostEvent {
    pool: Arc<SharedRegion>,
    index: u32,
}

impl HostEvent {
    pub fn index(&self) -> u32 {
        self.index
    }

    fn word(&self) -> Result<&std::sync::atomic::AtomicU32> {
        self.pool.atomic_u32(self.index as usize * EVENT_STRIDE)
    }
}

impl HostBackend {
    pub fn new() -> Self {
        Self {
            capabilities: Capabilities {
                name: "host",
                ipc_memory: true,
                ipc_events: true,
                sub_devices: 1,
            },
        }
    }

    /// A backend reporting the given capabilities. Operations it claims not
    /// to support fail with `Error::DeviceNotCapable`.
    pub fn with_capabilities(capabilities: Capabilities) -> Self {
        Self { capabilities }
    }

    fn memfd_name(kind: &str) -> String {
        let id = ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
        format!("mpbench-{kind}-{}-{id}", std::process::id())
    }

    fn encode(region: &SharedRegion, tag: [u8; 4], count: u32) -> Result<SharedHandle> {
        let fd = region
            .fd()
            .ok_or_else(|| Error::backend("host allocations cannot be exported"))?;
        let mut handle = SharedHandle::zeroed().with_descriptor(fd.as_raw_fd());
        let bytes = handle.as_bytes_mut();
        bytes[4..8].copy_from_slice(&tag);
        bytes[8..16].copy_from_slice(&(region.len() as u64).to_le_bytes());
        bytes[16..20].copy_from_slice(&count.to_le_bytes());
        Ok(handle)
    }

    fn decode(handle: &SharedHandle, tag: [u8; 4]) -> Result<(usize, u32)> {
        let bytes = handle.as_bytes();
        if bytes[4..8] != tag {
            return Err(Error::backend(format!(
                "handle tag {:?} does not match {:?}",
                String::from_utf8_lossy(&bytes[4..8]),
                String::from_utf8_lossy(&tag)
            )));
        }
        let mut len = [0u8; 8];
        len.copy_from_slice(&bytes[8..16]);
        let mut count = [0u8; 4];
        count.copy_from_slice(&bytes[16..20]);
        Ok((u64::from_le_bytes(len) as usize, u32::from_le_bytes(count)))
    }

    fn require(&self, supported: bool, what: &str) -> Result<()> {
        if supported {
            Ok(())
        } else {
            Err(Error::DeviceNotCapable(format!(
                "{} backend does not support {what}",
                self.capabilities.name
            )))
        }
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputeBackend for HostBackend {
    type Buffer = HostBuffer;
    type EventPool = HostEventPool;
    type Event = HostEvent;

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn allocate_device(&self, size: usize) -> Result<HostBuffer> {
        let region = SharedRegion::create(&Self::memfd_name("mem"), size)?;
        Ok(HostBuffer {
            region: Arc::new(region),
            origin: Origin::Device,
        })
    }

    fn allocate_host(&self, size: usize) -> Result<HostBuffer> {
        let region = SharedRegion::anonymous(size)?;
        Ok(HostBuffer {
            region: Arc::new(region),
            origin: Origin::Host,
        })
    }

    fn buffer_len(&self, buffer: &HostBuffer) -> usize {
        buffer.region.len()
    }

    fn export_buffer(&self, buffer: &HostBuffer) -> Result<SharedHandle> {
        self.require(self.capabilities.ipc_memory, "memory export")?;
        if buffer.origin == Origin::Imported {
            return Err(Error::backend("re-exporting an imported allocation"));
        }
        Self::encode(&buffer.region, MEMORY_TAG, 0)
    }

    fn import_buffer(&self, handle: ImportedHandle) -> Result<HostBuffer> {
        self.require(self.capabilities.ipc_memory, "memory import")?;
        let (handle, fd) = handle.into_parts();
        let (len, _) = Self::decode(&handle, MEMORY_TAG)?;
        let region = SharedRegion::open(fd, len)?;
        Ok(HostBuffer {
            region: Arc::new(region),
            origin: Origin::Imported,
        })
    }

    fn create_event_pool(&self, count: u32) -> Result<HostEventPool> {
        if count == 0 {
            return Err(Error::backend("empty event pool"));
        }
        let region = SharedRegion::create(&Self::memfd_name("events"), count as usize * EVENT_STRIDE)?;
        Ok(HostEventPool {
            region: Arc::new(region),
            count,
        })
    }

    fn event_pool_len(&self, pool: &HostEventPool) -> u32 {
        pool.count
    }

    fn export_event_pool(&self, pool: &HostEventPool) -> Result<SharedHandle> {
        self.require(self.capabilities.ipc_events, "event pool export")?;
        Self::encode(&pool.region, POOL_TAG, pool.count)
    }

    fn import_event_pool(&self, handle: ImportedHandle) -> Result<HostEventPool> {
        self.require(self.capabilities.ipc_events, "event pool import")?;
        let (handle, fd) = handle.into_parts();
        let (len, count) = Self::decode(&handle, POOL_TAG)?;
        if count == 0 || len < count as usize * EVENT_STRIDE {
            return Err(Error::backend(format!(
                "event pool handle describes {count} events in {len} bytes"
            )));
        }
        let region = SharedRegion::open(fd, len)?;
        Ok(HostEventPool {
            region: Arc::new(region),
            count,
        })
    }

    fn create_event(&self, pool: &HostEventPool, index: u32) -> Result<HostEvent> {
        if index >= pool.count {
            return Err(Error::backend(format!(
                "event index {index} outside pool of {}",
                pool.count
            )));
        }
        Ok(HostEvent {
            pool: pool.region.clone(),
            index,
        })
    }

    fn signal(&self, event: &HostEvent) -> Result<()> {
        event
            .word()?
            .compare_exchange(EVENT_RESET, EVENT_SIGNALED, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| {
                Error::protocol(format!(
                    "event {} signalled again before being reset",
                    event.index
                ))
            })
    }

    fn wait(&self, event: &HostEvent, timeout: Duration) -> Result<()> {
        let word = event.word()?;
        let deadline = Deadline::after(timeout);
        let mut backoff = Backoff::new();

        while word.load(Ordering::Acquire) != EVENT_SIGNALED {
            if deadline.expired() {
                return Err(Error::timeout(timeout, format!("event {}", event.index)));
            }
            backoff.snooze();
        }
        Ok(())
    }

    fn reset(&self, event: &HostEvent) -> Result<()> {
        event.word()?.store(EVENT_RESET, Ordering::Release);
        Ok(())
    }

    fn is_signaled(&self, event: &HostEvent) -> Result<bool> {
        Ok(event.word()?.load(Ordering::Acquire) == EVENT_SIGNALED)
    }

    fn copy(
        &self,
        dst: &HostBuffer,
        dst_offset: usize,
        src: &HostBuffer,
        src_offset: usize,
        len: usize,
    ) -> Result<()> {
        dst.region.copy_from(dst_offset, &src.region, src_offset, len)
    }

    fn write(&self, dst: &HostBuffer, offset: usize, bytes: &[u8]) -> Result<()> {
        dst.region.write_at(offset, bytes)
    }

    fn read(&self, src: &HostBuffer, offset: usize, out: &mut [u8]) -> Result<()> {
        src.region.read_at(offset, out)
    }

    fn synchronize(&self) -> Result<()> {
        // Work runs inline; only publish it to the other mappings.
        fence(Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;
    use std::thread;

    fn reimport(handle: SharedHandle, region: &SharedRegion) -> ImportedHandle {
        let fd = region.fd().unwrap().as_fd().try_clone_to_owned().unwrap();
        ImportedHandle::new(handle, fd)
    }

    #[test]
    fn test_buffer_export_import_shares_memory() {
        let backend = HostBackend::new();
        let buffer = backend.allocate_device(256).unwrap();
        let handle = backend.export_buffer(&buffer).unwrap();
        assert_eq!(&handle.as_bytes()[4..8], b"MPBM");

        let imported = backend.import_buffer(reimport(handle, buffer.region())).unwrap();
        assert!(imported.is_imported());
        assert_eq!(backend.buffer_len(&imported), 256);

        backend.write(&imported, 10, b"halo").unwrap();
        let mut out = [0u8; 4];
        backend.read(&buffer, 10, &mut out).unwrap();
        assert_eq!(&out, b"halo");

        drop(imported);
        backend.read(&buffer, 10, &mut out).unwrap();
        assert_eq!(&out, b"halo");
    }

    #[test]
    fn test_host_allocation_is_not_exportable() {
        let backend = HostBackend::new();
        let buffer = backend.allocate_host(64).unwrap();
        assert!(matches!(backend.export_buffer(&buffer), Err(Error::Backend(_))));
    }

    #[test]
    fn test_import_rejects_wrong_kind() {
        let backend = HostBackend::new();
        let pool = backend.create_event_pool(2).unwrap();
        let handle = backend.export_event_pool(&pool).unwrap();
        let err = backend.import_buffer(reimport(handle, &pool.region)).unwrap_err();
        assert!(matches!(err, Error::Backend(_)));
    }

    #[test]
    fn test_event_lifecycle() {
        let backend = HostBackend::new();
        let pool = backend.create_event_pool(4).unwrap();
        let event = backend.create_event(&pool, 3).unwrap();
        assert!(backend.create_event(&pool, 4).is_err());

        assert!(!backend.is_signaled(&event).unwrap());
        backend.signal(&event).unwrap();
        assert!(backend.is_signaled(&event).unwrap());
        assert!(matches!(backend.signal(&event), Err(Error::Protocol(_))));

        backend.wait(&event, Duration::from_millis(10)).unwrap();
        backend.reset(&event).unwrap();
        let err = backend.wait(&event, Duration::from_millis(10)).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_imported_pool_sees_signals() {
        let backend = HostBackend::new();
        let pool = backend.create_event_pool(2).unwrap();
        let handle = backend.export_event_pool(&pool).unwrap();
        let imported = backend.import_event_pool(reimport(handle, &pool.region)).unwrap();
        assert_eq!(backend.event_pool_len(&imported), 2);

        let local = backend.create_event(&pool, 1).unwrap();
        let remote = backend.create_event(&imported, 1).unwrap();

        thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(10));
                backend.signal(&remote).unwrap();
            });
            backend.wait(&local, Duration::from_secs(5)).unwrap();
        });
    }

    #[test]
    fn test_capabilities_gate_ipc() {
        let backend = HostBackend::with_capabilities(Capabilities {
            name: "limited",
            ipc_memory: false,
            ipc_events: true,
            sub_devices: 1,
        });
        assert!(!backend.capabilities().supports_ipc());
        let buffer = backend.allocate_device(64).unwrap();
        assert!(matches!(
            backend.export_buffer(&buffer),
            Err(Error::DeviceNotCapable(_))
        ));
    }
}
