//! Memory mappings the host backend hands out as "device" memory.

use crate::error::{Error, Result};
use std::ffi::CString;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::ptr::{self, NonNull};
use std::sync::atomic::AtomicU32;

/// A read/write mapping, either private to this process or backed by a
/// `memfd` that other processes can map as well.
///
/// Unmapped on drop. Accessors copy through raw pointers: another process
/// may write the same pages, so no Rust reference to the contents is ever
/// handed out except for the atomic words used as events.
#[derive(Debug)]
pub struct SharedRegion {
    ptr: NonNull<u8>,
    len: usize,
    fd: Option<OwnedFd>,
}

// The mapping is plain memory; all access goes through raw copies or atomics.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Private anonymous mapping; not exportable.
    pub fn anonymous(len: usize) -> Result<Self> {
        check_len(len)?;
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        Self::from_mapping(ptr, len, None)
    }

    /// New zero-filled `memfd` of `len` bytes, mapped shared.
    pub fn create(name: &str, len: usize) -> Result<Self> {
        check_len(len)?;
        let cname = CString::new(name)
            .map_err(|_| Error::backend(format!("memfd name {name:?} contains NUL")))?;

        let raw = unsafe { libc::memfd_create(cname.as_ptr(), libc::MFD_CLOEXEC) };
        if raw < 0 {
            return Err(Error::last_os("memfd_create"));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        if unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) } != 0 {
            return Err(Error::last_os("ftruncate"));
        }
        Self::map_shared(fd, len)
    }

    /// Maps an existing shared-memory descriptor; its size is taken from
    /// `fstat` and must be at least `expected_len`.
    pub fn open(fd: OwnedFd, expected_len: usize) -> Result<Self> {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd.as_raw_fd(), &mut stat) } != 0 {
            return Err(Error::last_os("fstat"));
        }
        let len = stat.st_size as usize;
        if len < expected_len {
            return Err(Error::backend(format!(
                "shared object is {len} bytes, handle describes {expected_len}"
            )));
        }
        check_len(len)?;
        Self::map_shared(fd, len)
    }

    fn map_shared(fd: OwnedFd, len: usize) -> Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        Self::from_mapping(ptr, len, Some(fd))
    }

    fn from_mapping(ptr: *mut libc::c_void, len: usize, fd: Option<OwnedFd>) -> Result<Self> {
        if ptr == libc::MAP_FAILED {
            return Err(Error::last_os("mmap"));
        }
        let ptr = NonNull::new(ptr as *mut u8).ok_or_else(|| Error::backend("mmap returned null"))?;
        Ok(Self { ptr, len, fd })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_shared(&self) -> bool {
        self.fd.is_some()
    }

    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(|fd| fd.as_fd())
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(Error::backend(format!(
                "range {offset}+{len} outside {}-byte region",
                self.len
            ))),
        }
    }

    pub fn read_at(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        self.check_range(offset, out.len())?;
        unsafe { ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), out.as_mut_ptr(), out.len()) };
        Ok(())
    }

    pub fn write_at(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.check_range(offset, bytes.len())?;
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.as_ptr().add(offset), bytes.len()) };
        Ok(())
    }

    pub fn fill(&self, byte: u8) {
        unsafe { ptr::write_bytes(self.ptr.as_ptr(), byte, self.len) };
    }

    /// Copies between two regions; overlapping ranges of the same region
    /// are allowed.
    pub fn copy_from(&self, dst_offset: usize, src: &SharedRegion, src_offset: usize, len: usize) -> Result<()> {
        self.check_range(dst_offset, len)?;
        src.check_range(src_offset, len)?;
        unsafe {
            ptr::copy(
                src.ptr.as_ptr().add(src_offset),
                self.ptr.as_ptr().add(dst_offset),
                len,
            )
        };
        Ok(())
    }

    /// The 4-byte aligned word at `offset`, for cross-process signalling.
    pub fn atomic_u32(&self, offset: usize) -> Result<&AtomicU32> {
        self.check_range(offset, 4)?;
        if offset % std::mem::align_of::<AtomicU32>() != 0 {
            return Err(Error::backend(format!("offset {offset} is not word aligned")));
        }
        Ok(unsafe { &*(self.ptr.as_ptr().add(offset) as *const AtomicU32) })
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

fn check_len(len: usize) -> Result<()> {
    if len == 0 {
        return Err(Error::backend("zero-sized allocation"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_memfd_is_zeroed_and_shared_between_mappings() {
        let a = SharedRegion::create("test", 4096).unwrap();
        let mut buf = [0xFFu8; 16];
        a.read_at(100, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);

        let dup = a.fd().unwrap().try_clone_to_owned().unwrap();
        let b = SharedRegion::open(dup, 4096).unwrap();
        a.write_at(100, b"shared").unwrap();

        let mut seen = [0u8; 6];
        b.read_at(100, &mut seen).unwrap();
        assert_eq!(&seen, b"shared");

        b.atomic_u32(8).unwrap().store(7, Ordering::Release);
        assert_eq!(a.atomic_u32(8).unwrap().load(Ordering::Acquire), 7);
    }

    #[test]
    fn test_bounds_and_alignment() {
        let region = SharedRegion::anonymous(64).unwrap();
        assert!(!region.is_shared());
        assert!(region.write_at(60, &[0u8; 8]).is_err());
        assert!(region.atomic_u32(2).is_err());
        assert!(region.atomic_u32(64).is_err());
        assert!(SharedRegion::anonymous(0).is_err());
    }

    #[test]
    fn test_open_rejects_short_object() {
        let a = SharedRegion::create("short", 128).unwrap();
        let dup = a.fd().unwrap().try_clone_to_owned().unwrap();
        assert!(matches!(SharedRegion::open(dup, 4096), Err(Error::Backend(_))));
    }
}
