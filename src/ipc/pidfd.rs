//! Descriptor translation through `pidfd_getfd(2)`.
//!
//! Lets a process duplicate a descriptor straight out of another process's
//! table, given only its pid and the descriptor number. Requires Linux 5.6+
//! and ptrace-attach permission over the target.

use crate::error::{Error, Result};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

fn syscall_error(call: &str, pid: libc::pid_t) -> Error {
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ENOSYS) => Error::Unsupported(format!("{call} is not available: {err}")),
        Some(libc::EPERM) => Error::Unsupported(format!(
            "{call} on pid {pid} not permitted (ptrace restrictions?): {err}"
        )),
        _ => Error::channel(format!("{call} on pid {pid} failed: {err}")),
    }
}

/// Opens a pidfd for `pid`.
pub fn open_pidfd(pid: libc::pid_t) -> Result<OwnedFd> {
    if pid <= 0 {
        return Err(Error::channel(format!("invalid pid {pid}")));
    }
    let raw = unsafe { libc::syscall(libc::SYS_pidfd_open, pid as libc::c_long, 0 as libc::c_long) };
    if raw < 0 {
        return Err(syscall_error("pidfd_open", pid));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(raw as RawFd) })
}

/// Duplicates descriptor `foreign_fd` of process `pid` into this process.
///
/// The returned descriptor is close-on-exec and refers to the same open
/// file description as the original.
pub fn translate_foreign_descriptor(pid: libc::pid_t, foreign_fd: RawFd) -> Result<OwnedFd> {
    if foreign_fd < 0 {
        return Err(Error::channel(format!("invalid foreign descriptor {foreign_fd}")));
    }
    let pidfd = open_pidfd(pid)?;

    let raw = unsafe {
        libc::syscall(
            libc::SYS_pidfd_getfd,
            pidfd.as_raw_fd() as libc::c_long,
            foreign_fd as libc::c_long,
            0 as libc::c_long,
        )
    };
    if raw < 0 {
        return Err(syscall_error("pidfd_getfd", pid));
    }

    tracing::trace!(pid, foreign_fd, local_fd = raw, "translated descriptor");
    Ok(unsafe { OwnedFd::from_raw_fd(raw as RawFd) })
}

/// Allows any process to translate this process's descriptors.
///
/// Under Yama `ptrace_scope = 1` only ancestors may attach; siblings
/// exchanging receive buffers need this. Failure (no Yama) is harmless
/// and only logged.
pub fn allow_foreign_translation() {
    let rc = unsafe {
        libc::prctl(
            libc::PR_SET_PTRACER,
            libc::c_ulong::MAX,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
        )
    };
    if rc != 0 {
        tracing::debug!(
            error = %io::Error::last_os_error(),
            "PR_SET_PTRACER not applied"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};

    #[test]
    fn test_translate_own_descriptor() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"pidfd").unwrap();

        let pid = std::process::id() as libc::pid_t;
        let fd = match translate_foreign_descriptor(pid, file.as_raw_fd()) {
            Ok(fd) => fd,
            // Old kernels and locked-down sandboxes.
            Err(Error::Unsupported(_)) => return,
            Err(e) => panic!("unexpected error: {e}"),
        };

        let mut dup = std::fs::File::from(fd);
        dup.seek(SeekFrom::Start(0)).unwrap();
        let mut contents = String::new();
        dup.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "pidfd");
    }

    #[test]
    fn test_translate_missing_descriptor_fails() {
        let pid = std::process::id() as libc::pid_t;
        match translate_foreign_descriptor(pid, 1_000_000) {
            Err(Error::Channel(_)) | Err(Error::Unsupported(_)) => {}
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_pid_and_descriptor() {
        assert!(matches!(open_pidfd(0), Err(Error::Channel(_))));
        assert!(matches!(
            translate_foreign_descriptor(1, -1),
            Err(Error::Channel(_))
        ));
    }
}
