//! Handle exchange strategies.
//!
//! An exporter makes a list of [`SharedHandle`]s available; an importer
//! turns them into [`ImportedHandle`]s backed by local descriptors. The
//! socket strategy pushes descriptors over a Unix socket, the pidfd strategy
//! pulls them out of the exporter's descriptor table.

use super::handle::{ImportedHandle, SharedHandle, HANDLE_SIZE};
use super::pidfd::{allow_foreign_translation, translate_foreign_descriptor};
use super::socket::{connect_with_retry, Listener};
use crate::config::{Config, Strategy};
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub trait HandleExporter {
    fn strategy(&self) -> Strategy;

    /// Makes `handles` importable. Blocks until every expected importer has
    /// received them when the strategy pushes.
    fn export_handles(&mut self, handles: &[SharedHandle]) -> Result<()>;
}

pub trait HandleImporter {
    fn strategy(&self) -> Strategy;

    /// Imports `count` handles, in the order they were exported.
    fn import_handles(&mut self, count: usize) -> Result<Vec<ImportedHandle>>;
}

/// Serves handles to a fixed number of peers over a listening socket.
#[derive(Debug, Clone)]
pub struct SocketExporter {
    path: PathBuf,
    peers: usize,
    accept_timeout: Duration,
    transfer_timeout: Duration,
}

impl SocketExporter {
    pub fn new<P: Into<PathBuf>>(path: P, peers: usize, config: &Config) -> Self {
        Self {
            path: path.into(),
            peers,
            accept_timeout: config.accept_timeout,
            transfer_timeout: config.connect_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl HandleExporter for SocketExporter {
    fn strategy(&self) -> Strategy {
        Strategy::Socket
    }

    fn export_handles(&mut self, handles: &[SharedHandle]) -> Result<()> {
        let mut listener = Listener::bind(&self.path)?;
        tracing::debug!(
            path = %self.path.display(),
            peers = self.peers,
            handles = handles.len(),
            "serving handles"
        );

        for peer in 0..self.peers {
            let connection = listener.accept(self.accept_timeout)?;
            connection.set_timeout(self.transfer_timeout)?;
            for handle in handles {
                connection.send_with_descriptor(handle.descriptor(), handle.as_bytes())?;
            }
            tracing::trace!(peer, "handles sent");
        }
        Ok(())
    }
}

/// Receives handles from a [`SocketExporter`].
#[derive(Debug, Clone)]
pub struct SocketImporter {
    path: PathBuf,
    retry_interval: Duration,
    connect_timeout: Duration,
}

impl SocketImporter {
    pub fn new<P: Into<PathBuf>>(path: P, config: &Config) -> Self {
        Self {
            path: path.into(),
            retry_interval: config.connect_retry_interval,
            connect_timeout: config.connect_timeout,
        }
    }
}

impl HandleImporter for SocketImporter {
    fn strategy(&self) -> Strategy {
        Strategy::Socket
    }

    fn import_handles(&mut self, count: usize) -> Result<Vec<ImportedHandle>> {
        let mut connection =
            connect_with_retry(&self.path, self.retry_interval, self.connect_timeout)?;
        connection.set_timeout(self.connect_timeout)?;

        let mut imported = Vec::with_capacity(count);
        for _ in 0..count {
            let mut bytes = [0u8; HANDLE_SIZE];
            let fd = connection.recv_with_descriptor(&mut bytes)?;
            imported.push(ImportedHandle::new(SharedHandle::from_bytes(bytes), fd));
        }
        tracing::debug!(path = %self.path.display(), count, "handles received");
        Ok(imported)
    }
}

/// Publishing side of the pidfd strategy. The handle bytes travel by other
/// means (arguments, a shared scratch buffer); exporting only opens this
/// process up for translation.
#[derive(Debug, Clone, Copy, Default)]
pub struct PidfdExporter;

impl HandleExporter for PidfdExporter {
    fn strategy(&self) -> Strategy {
        Strategy::Pidfd
    }

    fn export_handles(&mut self, handles: &[SharedHandle]) -> Result<()> {
        allow_foreign_translation();
        tracing::debug!(handles = handles.len(), "handles published for translation");
        Ok(())
    }
}

/// Translates published handles out of the exporter process.
#[derive(Debug, Clone)]
pub struct PidfdImporter {
    pid: libc::pid_t,
    published: Vec<SharedHandle>,
}

impl PidfdImporter {
    pub fn new(pid: libc::pid_t, published: Vec<SharedHandle>) -> Self {
        Self { pid, published }
    }
}

impl HandleImporter for PidfdImporter {
    fn strategy(&self) -> Strategy {
        Strategy::Pidfd
    }

    fn import_handles(&mut self, count: usize) -> Result<Vec<ImportedHandle>> {
        if count != self.published.len() {
            return Err(Error::protocol(format!(
                "asked for {count} handles but {} were published",
                self.published.len()
            )));
        }
        self.published
            .iter()
            .map(|handle| {
                let fd = translate_foreign_descriptor(self.pid, handle.descriptor())?;
                Ok(ImportedHandle::new(*handle, fd))
            })
            .collect()
    }
}
