//! Fixed-size IPC handles and their transport encoding.

use crate::error::{Error, Result};
use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

/// Size of every exported handle, in bytes.
pub const HANDLE_SIZE: usize = 64;

/// Lowercase hex codec for fixed-size binary blobs passed as process
/// arguments.
#[derive(Debug, Clone, Copy, Default)]
pub struct HexCodec;

impl HexCodec {
    /// Two lowercase characters per byte.
    pub fn encode(bytes: &[u8]) -> String {
        hex::encode(bytes)
    }

    /// Decodes exactly `N` bytes. Odd or mismatched lengths and non-hex
    /// characters are rejected.
    pub fn decode<const N: usize>(s: &str) -> Result<[u8; N]> {
        if s.len() % 2 != 0 {
            return Err(Error::encoding(format!("odd hex length {}", s.len())));
        }
        if s.len() != 2 * N {
            return Err(Error::encoding(format!(
                "expected {} hex characters, got {}",
                2 * N,
                s.len()
            )));
        }
        let mut out = [0u8; N];
        hex::decode_to_slice(s, &mut out).map_err(|e| Error::encoding(e.to_string()))?;
        Ok(out)
    }
}

/// Opaque handle identifying an exported memory allocation or event pool.
///
/// Bytes `0..4` hold the exporter-local descriptor number (little endian);
/// the rest is owned by the backend that produced it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SharedHandle([u8; HANDLE_SIZE]);

impl SharedHandle {
    pub const fn zeroed() -> Self {
        Self([0u8; HANDLE_SIZE])
    }

    pub const fn from_bytes(bytes: [u8; HANDLE_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HANDLE_SIZE] {
        &self.0
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; HANDLE_SIZE] {
        &mut self.0
    }

    pub fn descriptor(&self) -> RawFd {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.0[..4]);
        RawFd::from_le_bytes(raw)
    }

    /// The same handle, with its descriptor field pointing at `fd`.
    pub fn with_descriptor(mut self, fd: RawFd) -> Self {
        self.0[..4].copy_from_slice(&fd.to_le_bytes());
        self
    }

    pub fn to_hex(&self) -> String {
        HexCodec::encode(&self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        HexCodec::decode::<HANDLE_SIZE>(s).map(Self)
    }
}

impl Default for SharedHandle {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl fmt::Debug for SharedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedHandle")
            .field("fd", &self.descriptor())
            .field("bytes", &self.to_hex())
            .finish()
    }
}

/// A handle that arrived in this process, together with the local
/// descriptor it now refers to.
///
/// The kernel duplicated the exporter's descriptor on the way in, so
/// dropping this closes only the local copy.
#[derive(Debug)]
pub struct ImportedHandle {
    handle: SharedHandle,
    fd: OwnedFd,
}

impl ImportedHandle {
    /// Pairs a received handle with its local descriptor, patching the
    /// handle's descriptor field.
    pub fn new(handle: SharedHandle, fd: OwnedFd) -> Self {
        let handle = handle.with_descriptor(fd.as_raw_fd());
        Self { handle, fd }
    }

    pub fn handle(&self) -> &SharedHandle {
        &self.handle
    }

    pub fn fd(&self) -> &OwnedFd {
        &self.fd
    }

    pub fn into_parts(self) -> (SharedHandle, OwnedFd) {
        (self.handle, self.fd)
    }
}
