//! Release gate: lets a group of threads start a step at the same moment.
//!
//! The coordinator holds the lock exclusively while threads are being set
//! up; every thread blocks on a shared acquisition and they all proceed
//! once the coordinator lets go.

use parking_lot::{RwLock, RwLockWriteGuard};
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct ReleaseGate {
    lock: RwLock<()>,
    passed: AtomicUsize,
}

/// Held by the coordinator while the gate is closed. Dropping it opens the
/// gate, so an early return never strands the waiting threads.
#[derive(Debug)]
pub struct ClosedGate<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
}

impl<'a> ClosedGate<'a> {
    pub fn open(self) {}
}

impl ReleaseGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close(&self) -> ClosedGate<'_> {
        ClosedGate {
            _guard: self.lock.write(),
        }
    }

    /// Blocks while the gate is closed.
    pub fn pass(&self) {
        drop(self.lock.read());
        self.passed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn passed(&self) -> usize {
        self.passed.load(Ordering::Relaxed)
    }
}
