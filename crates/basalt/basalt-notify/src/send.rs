//! Per-connection send state machine.
//!
//! ```text
//!            attach            full send
//!   Idle ───────────▶ Sending ───────────▶ Done
//!    ▲                 │  ▲                 │
//!    │                 │  └── would block   │ attach (next write)
//!    │                 │                    ▼
//!    │                 └── hard error ──▶ Failed ──▶ (attach again)
//! ```
//!
//! The machine only moves the fixed frame. It never reads the blob: the peer
//! fetches that from shared memory once the frame arrives. Its one duty
//! toward the store is to hand back the reference the broadcaster took for
//! this peer if the frame can never be delivered.

use crate::envelope::EnvelopeRef;
use crate::registry::WorkerId;
use crate::transport::Transport;
use basalt_shm::ConfigStore;
use std::io;
use tracing::{debug, error};

#[derive(Debug, Default)]
pub enum SendState {
    #[default]
    Idle,
    Sending {
        envelope: EnvelopeRef,
        /// Frame bytes already accepted by the transport.
        sent: usize,
    },
    Done,
    Failed,
}

/// What one `on_write_ready` call achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendProgress {
    /// Nothing attached; spurious wake-up.
    Nothing,
    /// Transport is full. Wait for the next write-ready event.
    WouldBlock,
    /// Whole frame handed to the transport.
    Completed,
    /// Hard transport error; the peer's reference was released.
    Failed,
}

#[derive(Debug, Default)]
pub struct SendMachine {
    state: SendState,
}

impl SendMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &SendState {
        &self.state
    }

    /// True while a frame is attached and not yet fully sent.
    pub fn is_pending(&self) -> bool {
        matches!(self.state, SendState::Sending { .. })
    }

    /// Attaches a new envelope. Hands it back if a previous one is still
    /// in flight.
    pub fn attach(&mut self, envelope: EnvelopeRef) -> Result<(), EnvelopeRef> {
        if self.is_pending() {
            return Err(envelope);
        }
        self.state = SendState::Sending { envelope, sent: 0 };
        Ok(())
    }

    /// Pushes as much of the attached frame as the transport takes.
    pub fn on_write_ready<T: Transport>(
        &mut self,
        peer: WorkerId,
        transport: &mut T,
        store: &ConfigStore,
    ) -> SendProgress {
        let SendState::Sending { envelope, sent } = &mut self.state else {
            return SendProgress::Nothing;
        };

        while *sent < envelope.bytes().len() {
            let rest = &envelope.bytes()[*sent..];
            match transport.send(rest) {
                Ok(0) => {
                    let e = io::Error::from(io::ErrorKind::WriteZero);
                    return self.fail(peer, store, e);
                }
                Ok(n) => *sent += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    debug!(peer, sent = *sent, "config notify send would block");
                    return SendProgress::WouldBlock;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return self.fail(peer, store, e),
            }
        }

        debug!(
            peer,
            generation = envelope.generation(),
            remaining = envelope.pending_sends() - 1,
            "config notify sent"
        );
        // Dropping our handle is the pendingSends decrement.
        self.state = SendState::Done;
        SendProgress::Completed
    }

    fn fail(&mut self, peer: WorkerId, store: &ConfigStore, e: io::Error) -> SendProgress {
        error!(peer, error = %e, "config notify send failed");
        // The peer will never consume this version: give its reference back.
        store.release();
        self.state = SendState::Failed;
        SendProgress::Failed
    }

    /// Connection is going away. Releases the reference of an undelivered
    /// frame, exactly once. Returns whether a release happened.
    pub fn teardown(&mut self, store: &ConfigStore) -> bool {
        if self.is_pending() {
            store.release();
            self.state = SendState::Failed;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_shm::StoreOptions;
    use std::collections::VecDeque;
    use std::io::{Read, Write};

    /// Transport that replays a script of write results.
    struct Scripted {
        script: VecDeque<io::Result<usize>>,
        written: Vec<u8>,
    }

    impl Scripted {
        fn new(script: Vec<io::Result<usize>>) -> Self {
            Self {
                script: script.into(),
                written: Vec::new(),
            }
        }
    }

    impl Write for Scripted {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = self.script.pop_front().unwrap_or(Ok(buf.len()))?;
            let n = n.min(buf.len());
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Read for Scripted {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::ErrorKind::WouldBlock.into())
        }
    }

    fn store_with_refs(dir: &tempfile::TempDir, refs: u64) -> ConfigStore {
        let store = ConfigStore::create(dir.path().join("store"), StoreOptions::default()).unwrap();
        store.install_with_readers(b"{}", refs).unwrap();
        store
    }

    #[test]
    fn idle_machine_ignores_write_ready() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_refs(&dir, 0);
        let mut m = SendMachine::new();
        let mut t = Scripted::new(vec![]);
        assert_eq!(m.on_write_ready(0, &mut t, &store), SendProgress::Nothing);
        assert!(t.written.is_empty());
    }

    #[test]
    fn partial_sends_resume_where_they_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_refs(&dir, 1);
        let env = EnvelopeRef::config_changed(1);
        let watch = env.watch();

        let mut m = SendMachine::new();
        m.attach(env).unwrap();

        let mut t = Scripted::new(vec![
            Ok(3),
            Err(io::ErrorKind::WouldBlock.into()),
            Err(io::ErrorKind::Interrupted.into()),
            Ok(2),
        ]);

        assert_eq!(m.on_write_ready(1, &mut t, &store), SendProgress::WouldBlock);
        assert!(matches!(m.state(), SendState::Sending { sent: 3, .. }));

        assert_eq!(m.on_write_ready(1, &mut t, &store), SendProgress::Completed);
        assert_eq!(t.written, basalt_frame::NotificationFrame::config_changed().encode());
        assert!(matches!(m.state(), SendState::Done));
        assert!(watch.upgrade().is_none());
        // Successful sends leave the reference for the receiver to drop.
        assert_eq!(store.refcount(), 1);
    }

    #[test]
    fn hard_error_releases_the_peers_reference() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_refs(&dir, 2);

        let mut m = SendMachine::new();
        m.attach(EnvelopeRef::config_changed(1)).unwrap();
        let mut t = Scripted::new(vec![Err(io::ErrorKind::BrokenPipe.into())]);

        assert_eq!(m.on_write_ready(4, &mut t, &store), SendProgress::Failed);
        assert!(matches!(m.state(), SendState::Failed));
        assert_eq!(store.refcount(), 1);
    }

    #[test]
    fn zero_length_write_counts_as_failure() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_refs(&dir, 1);

        let mut m = SendMachine::new();
        m.attach(EnvelopeRef::config_changed(1)).unwrap();
        let mut t = Scripted::new(vec![Ok(0)]);

        assert_eq!(m.on_write_ready(0, &mut t, &store), SendProgress::Failed);
        assert_eq!(store.refcount(), 0);
    }

    #[test]
    fn attach_refuses_while_sending_and_teardown_releases_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_refs(&dir, 1);

        let mut m = SendMachine::new();
        m.attach(EnvelopeRef::config_changed(1)).unwrap();
        assert!(m.attach(EnvelopeRef::config_changed(2)).is_err());

        assert!(m.teardown(&store));
        assert!(!m.teardown(&store));
        assert_eq!(store.refcount(), 0);
    }
}
