//! Queue of deferred readiness events.
//!
//! Broadcasting never writes to a socket directly. It posts a write event for
//! every target connection and returns; the event loop drains the queue
//! after the current dispatch, running each connection's send machine on its
//! own turn.

use crate::registry::WorkerId;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostedEvent {
    /// Run the send machine of the control connection to this worker.
    Write(WorkerId),
}

#[derive(Debug, Default)]
pub struct PostedEvents {
    queue: VecDeque<PostedEvent>,
}

impl PostedEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&mut self, ev: PostedEvent) {
        self.queue.push_back(ev);
    }

    pub fn pop(&mut self) -> Option<PostedEvent> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
