//! Control connections from this worker to its siblings.
//!
//! Slot `i` holds the connection used to notify worker `i`, or nothing while
//! that worker is not reachable. The event loop owns the registry and is the
//! only one that adds or removes connections; the broadcaster just walks it.

use crate::envelope::EnvelopeRef;
use crate::posted::{PostedEvent, PostedEvents};
use crate::send::{SendMachine, SendProgress};
use crate::transport::Transport;
use basalt_shm::ConfigStore;
use tracing::debug;

pub type WorkerId = usize;

pub struct ControlConnection<T> {
    peer: WorkerId,
    transport: T,
    /// Last known write readiness. Cleared when a send would block and set
    /// again by the event loop on the next writable event.
    write_ready: bool,
    sender: SendMachine,
}

impl<T: Transport> ControlConnection<T> {
    /// A freshly connected socket is assumed writable.
    pub fn new(peer: WorkerId, transport: T) -> Self {
        Self {
            peer,
            transport,
            write_ready: true,
            sender: SendMachine::new(),
        }
    }

    pub fn peer(&self) -> WorkerId {
        self.peer
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Can take a new notification right now.
    pub fn is_write_ready(&self) -> bool {
        self.write_ready && !self.sender.is_pending()
    }

    /// A frame is attached and waiting for write readiness.
    pub fn wants_write(&self) -> bool {
        self.sender.is_pending()
    }

    pub fn set_write_ready(&mut self) {
        self.write_ready = true;
    }

    pub(crate) fn attach(&mut self, envelope: EnvelopeRef) -> Result<(), EnvelopeRef> {
        self.sender.attach(envelope)
    }

    /// Runs the send machine for one write-ready event.
    pub fn on_write_ready(&mut self, store: &ConfigStore) -> SendProgress {
        let progress = self
            .sender
            .on_write_ready(self.peer, &mut self.transport, store);
        if progress == SendProgress::WouldBlock {
            self.write_ready = false;
        }
        progress
    }

    /// Teardown hook: releases the reference of an undelivered frame.
    pub fn close(mut self, store: &ConfigStore) -> T {
        if self.sender.teardown(store) {
            debug!(peer = self.peer, "released reference of undelivered notify");
        }
        self.transport
    }
}

pub struct ConnectionRegistry<T> {
    slots: Vec<Option<ControlConnection<T>>>,
}

impl<T: Transport> ConnectionRegistry<T> {
    pub fn with_workers(workers: usize) -> Self {
        Self {
            slots: (0..workers).map(|_| None).collect(),
        }
    }

    pub fn workers(&self) -> usize {
        self.slots.len()
    }

    /// Installs the connection to `conn.peer()`, returning any previous one.
    ///
    /// The caller must `close` the returned connection so that an
    /// undelivered frame gives its reference back.
    pub fn insert(&mut self, conn: ControlConnection<T>) -> Option<ControlConnection<T>> {
        let peer = conn.peer();
        if peer >= self.slots.len() {
            self.slots.resize_with(peer + 1, || None);
        }
        self.slots[peer].replace(conn)
    }

    pub fn remove(&mut self, peer: WorkerId) -> Option<ControlConnection<T>> {
        self.slots.get_mut(peer).and_then(Option::take)
    }

    pub fn get(&self, peer: WorkerId) -> Option<&ControlConnection<T>> {
        self.slots.get(peer).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, peer: WorkerId) -> Option<&mut ControlConnection<T>> {
        self.slots.get_mut(peer).and_then(Option::as_mut)
    }

    pub fn is_connected(&self, peer: WorkerId) -> bool {
        self.get(peer).is_some()
    }

    pub fn live(&self) -> impl Iterator<Item = &ControlConnection<T>> {
        self.slots.iter().flatten()
    }

    /// Drains posted write events, running each target's send machine.
    /// Returns how many frames completed.
    pub fn run_posted(&mut self, posted: &mut PostedEvents, store: &ConfigStore) -> usize {
        let mut completed = 0;
        while let Some(ev) = posted.pop() {
            let PostedEvent::Write(peer) = ev;
            let Some(conn) = self.get_mut(peer) else {
                continue;
            };
            if conn.on_write_ready(store) == SendProgress::Completed {
                completed += 1;
            }
        }
        completed
    }

    /// Tears down every connection, releasing undelivered references.
    pub fn close_all(&mut self, store: &ConfigStore) {
        for slot in self.slots.iter_mut() {
            if let Some(conn) = slot.take() {
                conn.close(store);
            }
        }
    }
}
