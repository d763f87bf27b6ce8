//! The notification shared by every connection of one broadcast.
//!
//! One envelope is built per write and cloned into the send slot of each
//! scheduled connection. The clone count is the number of sends still
//! outstanding; the envelope's memory goes away with the last clone, when
//! the last send completes or fails.

use basalt_frame::{FRAME_SIZE, NotificationFrame};
use std::rc::{Rc, Weak};

#[derive(Debug)]
pub struct Envelope {
    frame: [u8; FRAME_SIZE],
    generation: u64,
}

impl Envelope {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// A counted handle on an `Envelope`.
#[derive(Debug, Clone)]
pub struct EnvelopeRef(Rc<Envelope>);

impl EnvelopeRef {
    pub fn config_changed(generation: u64) -> Self {
        Self(Rc::new(Envelope {
            frame: NotificationFrame::config_changed().encode(),
            generation,
        }))
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.0.frame
    }

    pub fn generation(&self) -> u64 {
        self.0.generation
    }

    /// Handles still alive, i.e. sends not yet finished.
    pub fn pending_sends(&self) -> usize {
        Rc::strong_count(&self.0)
    }

    /// Observer that does not keep the envelope alive.
    pub fn watch(&self) -> Weak<Envelope> {
        Rc::downgrade(&self.0)
    }
}
