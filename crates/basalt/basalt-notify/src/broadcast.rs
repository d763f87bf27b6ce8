//! Installs a new configuration and fans the notification out.
//!
//! # Steps
//! 1. Pick the targets: every live connection that can take a write now.
//!    Connections that are busy or not writable are skipped for this round
//!    and not retried; their workers catch up on the next write.
//! 2. Install the payload with one reference per target, in one critical
//!    section. On failure nothing else happens.
//! 3. Build one envelope and attach a handle to every target's send slot.
//! 4. Post a write event per target. No socket is touched here.

use crate::envelope::{Envelope, EnvelopeRef};
use crate::posted::{PostedEvent, PostedEvents};
use crate::registry::{ConnectionRegistry, WorkerId};
use crate::transport::Transport;
use basalt_shm::{ConfigStore, StoreError};
use std::rc::Weak;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    #[error("a previous configuration is still being delivered ({outstanding} pending)")]
    Busy { outstanding: u64 },

    #[error("failed to store the new configuration")]
    StoreFailed(#[source] StoreError),
}

#[derive(Debug)]
pub struct BroadcastReport {
    pub generation: u64,
    /// Connections a notification was scheduled on. Equals the references
    /// taken for this write.
    pub scheduled: usize,
    /// Live connections passed over because they could not take a write.
    pub skipped: usize,
    /// Observes the shared envelope without keeping it alive.
    pub envelope: Weak<Envelope>,
}

pub struct Broadcaster {
    store: Arc<ConfigStore>,
}

impl Broadcaster {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    /// The write gate must have been checked by the caller.
    pub fn broadcast<T: Transport>(
        &self,
        payload: &[u8],
        registry: &mut ConnectionRegistry<T>,
        posted: &mut PostedEvents,
    ) -> Result<BroadcastReport, BroadcastError> {
        let mut targets: Vec<WorkerId> = Vec::with_capacity(registry.workers());
        let mut skipped = 0usize;
        for conn in registry.live() {
            if conn.is_write_ready() {
                targets.push(conn.peer());
            } else {
                skipped += 1;
            }
        }

        let report = self
            .store
            .install_with_readers(payload, targets.len() as u64)
            .map_err(BroadcastError::StoreFailed)?;

        let envelope = EnvelopeRef::config_changed(report.generation);
        let watch = envelope.watch();

        for &peer in &targets {
            // Filtered above, so attach cannot refuse. If it does, hand the
            // reference back.
            let attached = registry
                .get_mut(peer)
                .is_some_and(|conn| conn.attach(envelope.clone()).is_ok());
            if attached {
                posted.post(PostedEvent::Write(peer));
            } else {
                self.store.release();
            }
        }
        drop(envelope);

        info!(
            generation = report.generation,
            bytes = payload.len(),
            scheduled = targets.len(),
            skipped,
            "config broadcast"
        );
        debug!(
            superseded = ?report.superseded,
            refcount = report.refcount,
            "config store after install"
        );

        Ok(BroadcastReport {
            generation: report.generation,
            scheduled: targets.len(),
            skipped,
            envelope: watch,
        })
    }
}
