//! Unix-domain socket channel that carries one descriptor per message.
//!
//! The exporter binds a [`Listener`] at a well-known path; importers reach it
//! with [`connect_with_retry`]. Each message is a fixed-size payload with a
//! single `SCM_RIGHTS` descriptor attached.

use crate::error::{Error, Result};
use crate::util::Deadline;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

// sizeof(sockaddr_un::sun_path) on Linux
const SUN_PATH_LEN: usize = 108;
const BACKLOG: libc::c_int = 1024;

fn check_path(path: &Path) -> Result<()> {
    if path.as_os_str().len() + 1 > SUN_PATH_LEN {
        return Err(Error::channel(format!(
            "socket path {} exceeds {} bytes",
            path.display(),
            SUN_PATH_LEN - 1
        )));
    }
    Ok(())
}

/// Listening socket bound to a filesystem path. Owns every connection it
/// accepted and unlinks the path when dropped.
#[derive(Debug)]
pub struct Listener {
    inner: UnixListener,
    path: PathBuf,
    connections: Vec<Connection>,
    hung_up: Vec<bool>,
}

impl Listener {
    /// Unlinks any stale socket at `path`, then binds and listens.
    pub fn bind<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        check_path(path)?;

        match std::fs::remove_file(path) {
            Ok(()) => tracing::debug!(path = %path.display(), "removed stale socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::channel(format!(
                    "cannot remove stale socket {}: {e}",
                    path.display()
                )))
            }
        }

        let inner = UnixListener::bind(path)
            .map_err(|e| Error::channel(format!("bind {} failed: {e}", path.display())))?;

        // std listens with a small backlog; every rank may connect at once.
        if unsafe { libc::listen(inner.as_raw_fd(), BACKLOG) } != 0 {
            return Err(Error::last_os("listen"));
        }

        Ok(Self {
            inner,
            path: path.to_path_buf(),
            connections: Vec::new(),
            hung_up: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Blocks until the next peer connects.
    ///
    /// The listener is polled together with every connection accepted so
    /// far, so a peer that hangs up early is noticed instead of hiding behind
    /// a blocking `accept`.
    pub fn accept(&mut self, timeout: Duration) -> Result<&mut Connection> {
        let deadline = Deadline::after(timeout);

        loop {
            let mut fds = Vec::with_capacity(self.connections.len() + 1);
            fds.push(libc::pollfd {
                fd: self.inner.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            });
            let watched: Vec<usize> = (0..self.connections.len())
                .filter(|&i| !self.hung_up[i])
                .collect();
            for &i in &watched {
                fds.push(libc::pollfd {
                    fd: self.connections[i].as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                });
            }

            let rc = unsafe {
                libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, deadline.poll_millis())
            };
            if rc < 0 {
                if io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(Error::last_os("poll"));
            }
            if rc == 0 {
                return Err(Error::timeout(
                    timeout,
                    format!("a peer to connect to {}", self.path.display()),
                ));
            }

            for (slot, &i) in fds[1..].iter().zip(&watched) {
                if slot.revents != 0 {
                    tracing::debug!(connection = i, "peer finished with its connection");
                    self.hung_up[i] = true;
                }
            }

            let listener = fds[0].revents;
            if listener & (libc::POLLERR | libc::POLLNVAL) != 0 {
                return Err(Error::channel(format!(
                    "listening socket {} failed",
                    self.path.display()
                )));
            }
            if listener & libc::POLLIN != 0 {
                break;
            }
        }

        let (stream, _) = self
            .inner
            .accept()
            .map_err(|e| Error::channel(format!("accept failed: {e}")))?;
        self.connections.push(Connection::from_stream(stream));
        self.hung_up.push(false);

        let index = self.connections.len() - 1;
        Ok(&mut self.connections[index])
    }

    pub fn connections(&self) -> usize {
        self.connections.len()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Connects to `path`, retrying while the exporter has not bound it yet.
///
/// A missing path and a refused connection (bound but not yet listening, or
/// a stale file about to be replaced) are retried every `interval`; any
/// other failure is returned immediately.
pub fn connect_with_retry<P: AsRef<Path>>(
    path: P,
    interval: Duration,
    timeout: Duration,
) -> Result<Connection> {
    let path = path.as_ref();
    check_path(path)?;
    let deadline = Deadline::after(timeout);
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match UnixStream::connect(path) {
            Ok(stream) => {
                tracing::trace!(path = %path.display(), attempts, "connected");
                return Ok(Connection::from_stream(stream));
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
                ) =>
            {
                if deadline.expired() {
                    return Err(Error::timeout(
                        timeout,
                        format!("{} to accept connections", path.display()),
                    ));
                }
                thread::sleep(interval.min(deadline.remaining()));
            }
            Err(e) => {
                return Err(Error::channel(format!(
                    "connect to {} failed: {e}",
                    path.display()
                )))
            }
        }
    }
}

/// One connected end of the channel.
#[derive(Debug)]
pub struct Connection {
    stream: UnixStream,
    timeout: Option<Duration>,
}

impl Connection {
    fn from_stream(stream: UnixStream) -> Self {
        Self {
            stream,
            timeout: None,
        }
    }

    /// A connected pair, for handing descriptors around inside one process
    /// or across a `fork`.
    pub fn pair() -> Result<(Connection, Connection)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::from_stream(a), Self::from_stream(b)))
    }

    /// Bounds every subsequent send and receive.
    pub fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.stream.set_read_timeout(Some(timeout))?;
        self.stream.set_write_timeout(Some(timeout))?;
        self.timeout = Some(timeout);
        Ok(())
    }

    /// Sends `payload` with `fd` attached in a single message.
    pub fn send_with_descriptor(&self, fd: RawFd, payload: &[u8]) -> Result<()> {
        let mut iov = libc::iovec {
            iov_base: payload.as_ptr() as *mut libc::c_void,
            iov_len: payload.len(),
        };
        let mut control = ControlBuffer::new();

        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr();
        msg.msg_controllen = control.len() as _;

        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            if cmsg.is_null() {
                return Err(Error::channel("no room for a control message"));
            }
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as _;
            std::ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut RawFd, fd);
        }

        let sent = loop {
            let sent = unsafe { libc::sendmsg(self.stream.as_raw_fd(), &msg, libc::MSG_NOSIGNAL) };
            if sent >= 0 {
                break sent;
            }
            match self.transfer_error("sendmsg") {
                None => continue,
                Some(e) => return Err(e),
            }
        };
        if sent as usize != payload.len() {
            return Err(Error::channel(format!(
                "short send: {sent} of {} bytes",
                payload.len()
            )));
        }
        Ok(())
    }

    /// Receives exactly `payload.len()` bytes plus the attached descriptor.
    pub fn recv_with_descriptor(&self, payload: &mut [u8]) -> Result<OwnedFd> {
        let mut iov = libc::iovec {
            iov_base: payload.as_mut_ptr() as *mut libc::c_void,
            iov_len: payload.len(),
        };
        let mut control = ControlBuffer::new();

        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr();
        msg.msg_controllen = control.len() as _;

        let received = loop {
            let received = unsafe {
                libc::recvmsg(self.stream.as_raw_fd(), &mut msg, libc::MSG_CMSG_CLOEXEC)
            };
            if received >= 0 {
                break received;
            }
            match self.transfer_error("recvmsg") {
                None => continue,
                Some(e) => return Err(e),
            }
        };

        // Adopt the descriptor first so an error below still closes it.
        let fd = unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            if cmsg.is_null()
                || (*cmsg).cmsg_level != libc::SOL_SOCKET
                || (*cmsg).cmsg_type != libc::SCM_RIGHTS
            {
                None
            } else {
                let raw = std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const RawFd);
                is_received_descriptor(raw).then(|| OwnedFd::from_raw_fd(raw))
            }
        };

        if received as usize != payload.len() {
            return Err(Error::channel(format!(
                "short receive: {received} of {} bytes",
                payload.len()
            )));
        }
        if msg.msg_flags & libc::MSG_CTRUNC != 0 {
            return Err(Error::channel("control message truncated"));
        }
        fd.ok_or_else(|| Error::channel("message carried no descriptor"))
    }
}

impl Connection {
    /// Classifies the last failed transfer. `None` means interrupted: retry.
    fn transfer_error(&self, call: &str) -> Option<Error> {
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => None,
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Some(Error::timeout(
                self.timeout.unwrap_or_default(),
                format!("{call} on a peer that went quiet"),
            )),
            _ => Some(Error::channel(format!("{call} failed: {err}"))),
        }
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}


/// Any non-negative number is a descriptor the kernel installed for us,
/// including 0 when stdin was closed.
fn is_received_descriptor(raw: RawFd) -> bool {
    raw >= 0
}

/// Control-message space for one descriptor, aligned for `cmsghdr`.
struct ControlBuffer {
    words: [u64; 4],
    len: usize,
}

impl ControlBuffer {
    fn new() -> Self {
        let len = unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) } as usize;
        debug_assert!(len <= mem::size_of::<[u64; 4]>());
        Self { words: [0; 4], len }
    }

    fn as_mut_ptr(&mut self) -> *mut libc::c_void {
        self.words.as_mut_ptr() as *mut libc::c_void
    }

    fn len(&self) -> usize {
        self.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};

    fn temp_file_with(contents: &[u8]) -> std::fs::File {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(contents).unwrap();
        file
    }

    #[test]
    fn test_pair_transfers_payload_and_descriptor() {
        let (tx, rx) = Connection::pair().unwrap();
        let file = temp_file_with(b"descriptor");

        let payload: Vec<u8> = (0..64u8).collect();
        tx.send_with_descriptor(file.as_raw_fd(), &payload).unwrap();

        let mut received = [0u8; 64];
        let fd = rx.recv_with_descriptor(&mut received).unwrap();
        assert_eq!(&received[..], &payload[..]);
        assert_ne!(fd.as_raw_fd(), file.as_raw_fd());

        let mut dup = std::fs::File::from(fd);
        dup.seek(SeekFrom::Start(0)).unwrap();
        let mut contents = String::new();
        dup.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "descriptor");
    }

    #[test]
    fn test_recv_without_descriptor_fails() {
        let (tx, rx) = Connection::pair().unwrap();
        (&tx.stream).write_all(&[1u8; 8]).unwrap();

        let mut buf = [0u8; 8];
        let err = rx.recv_with_descriptor(&mut buf).unwrap_err();
        assert!(matches!(err, Error::Channel(_)));
    }

    #[test]
    fn test_short_receive_fails() {
        let (tx, rx) = Connection::pair().unwrap();
        let file = temp_file_with(b"x");
        tx.send_with_descriptor(file.as_raw_fd(), &[7u8; 16]).unwrap();
        drop(tx);

        let mut buf = [0u8; 32];
        assert!(rx.recv_with_descriptor(&mut buf).is_err());
    }

    #[test]
    fn test_idle_peer_times_out() {
        let (mut rx, _tx) = Connection::pair().unwrap();
        rx.set_timeout(Duration::from_millis(20)).unwrap();

        let mut buf = [0u8; 8];
        let err = rx.recv_with_descriptor(&mut buf).unwrap_err();
        assert!(err.is_timeout(), "{err:?}");
        assert!(matches!(err, Error::Timeout(t, _) if t == Duration::from_millis(20)));
    }

    #[test]
    fn test_descriptor_zero_is_valid() {
        assert!(is_received_descriptor(0));
        assert!(is_received_descriptor(17));
        assert!(!is_received_descriptor(-1));
    }

    #[test]
    fn test_bind_rejects_long_path() {
        let long = format!("/tmp/{}.socket", "x".repeat(SUN_PATH_LEN));
        assert!(matches!(Listener::bind(&long), Err(Error::Channel(_))));
    }

    #[test]
    fn test_bind_replaces_stale_path_and_unlinks_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.socket");
        std::fs::write(&path, b"stale").unwrap();

        let listener = Listener::bind(&path).unwrap();
        assert!(path.exists());
        drop(listener);
        assert!(!path.exists());
    }

    #[test]
    fn test_accept_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut listener = Listener::bind(dir.path().join("idle.socket")).unwrap();
        let err = listener.accept(Duration::from_millis(30)).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_connect_times_out_without_listener() {
        let dir = tempfile::tempdir().unwrap();
        let err = connect_with_retry(
            dir.path().join("never.socket"),
            Duration::from_millis(5),
            Duration::from_millis(40),
        )
        .unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_accept_multiple_peers_after_early_hangup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("multi.socket");
        let mut listener = Listener::bind(&path).unwrap();

        let first = connect_with_retry(&path, Duration::from_millis(5), Duration::from_secs(5))
            .unwrap();
        listener.accept(Duration::from_secs(5)).unwrap();
        drop(first);

        let path2 = path.clone();
        let second = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            connect_with_retry(&path2, Duration::from_millis(5), Duration::from_secs(5)).unwrap()
        });
        listener.accept(Duration::from_secs(5)).unwrap();
        assert_eq!(listener.connections(), 2);
        drop(second.join().unwrap());
    }
}
