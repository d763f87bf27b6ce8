//! Single-flight gate for configuration writes.
//!
//! The counter is the store's reference count: it goes up by one per
//! notification a broadcast schedules and down by one per delivery that is
//! consumed or compensated. Because it lives in shared memory, every worker
//! sees the same gate, whichever one receives the write request.
//!
//! The check is a point in time, not a reservation. Two requests that pass it
//! at once both proceed; the store keeps that safe (superseded blobs are
//! retired, never freed under a reader) and the later write simply wins.

use crate::broadcast::BroadcastError;
use basalt_shm::ConfigStore;
use std::sync::Arc;

pub struct WriteGate {
    store: Arc<ConfigStore>,
}

impl WriteGate {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self { store }
    }

    /// Notifications issued and not yet acknowledged.
    pub fn outstanding(&self) -> u64 {
        self.store.refcount()
    }

    /// True when a configuration-mutating request may proceed.
    pub fn try_acquire(&self) -> bool {
        self.outstanding() == 0
    }

    /// `try_acquire` as a `Result`, for `?` in request handlers.
    pub fn check(&self) -> Result<(), BroadcastError> {
        match self.outstanding() {
            0 => Ok(()),
            outstanding => Err(BroadcastError::Busy { outstanding }),
        }
    }
}
