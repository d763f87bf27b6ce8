//! Per-connection receive state machine.
//!
//! One readiness event, one receive. A well-formed frame means "the shared
//! blob changed": copy it out under the store lock while dropping this
//! worker's reference, then parse and apply the private copy with no lock
//! held. Every failure is local to this delivery. It is logged, the
//! reference is returned, and the connection stays armed for the next frame.

use crate::engine::{ConfigEngine, EngineError};
use basalt_frame::{FRAME_SIZE, FrameError, NotificationFrame};
use basalt_shm::{ConfigStore, StoreError};
use std::io;
use tracing::{debug, error, warn};

/// Receive buffer. Larger than one frame so that oversize reads are seen as
/// a size mismatch instead of being silently split.
const RECV_BUF: usize = 4 * FRAME_SIZE;

#[derive(Debug, thiserror::Error)]
pub enum RecvFailure {
    #[error("control connection closed by peer")]
    Closed,

    #[error("control connection receive failed")]
    Io(#[source] io::Error),

    #[error("malformed notification")]
    Frame(#[from] FrameError),

    #[error("notification arrived but the shared blob is gone")]
    Store(#[source] StoreError),
}

/// Successful outcomes of one read-ready event.
#[derive(Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Spurious wake-up, nothing to read.
    Idle,
    /// Snapshot parsed and applied.
    Applied { bytes: usize },
    /// Snapshot taken, but the engine refused it. The previous configuration
    /// stays active.
    Rejected(EngineError),
}

pub struct ReceiveMachine {
    buf: [u8; RECV_BUF],
    snapshot: Vec<u8>,
}

impl Default for ReceiveMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiveMachine {
    pub fn new() -> Self {
        Self {
            buf: [0u8; RECV_BUF],
            snapshot: Vec::new(),
        }
    }

    /// Handles one read-ready event on a control connection.
    ///
    /// `Err` results have already released this worker's reference (except
    /// `Store`, where there was nothing left to release) and been logged;
    /// callers only need them to decide whether to drop a closed connection.
    pub fn on_read_ready<T, E>(
        &mut self,
        transport: &mut T,
        store: &ConfigStore,
        engine: &mut E,
    ) -> Result<Delivery, RecvFailure>
    where
        T: crate::transport::Transport,
        E: ConfigEngine,
    {
        let n = loop {
            match transport.recv(&mut self.buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Delivery::Idle),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "config notify recv error");
                    store.release();
                    return Err(RecvFailure::Io(e));
                }
            }
        };

        if n == 0 {
            // Released even when the exiting peer had no frame in flight, in
            // which case this takes a reference still owed to a live worker.
            // The counter never goes below zero.
            error!("config notify recv error: connection closed");
            store.release();
            return Err(RecvFailure::Closed);
        }

        if let Err(e) = NotificationFrame::decode(&self.buf[..n]) {
            warn!(error = %e, received = n, "config notify message rejected");
            store.release();
            return Err(e.into());
        }

        if let Err(e) = store.snapshot_and_release_into(&mut self.snapshot) {
            error!(error = %e, "config notify snapshot failed");
            return Err(RecvFailure::Store(e));
        }
        let bytes = self.snapshot.len();
        debug!(bytes, "config snapshot taken");

        // No lock held from here on.
        let parsed = match engine.parse(&self.snapshot) {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "router conf parse failed");
                return Ok(Delivery::Rejected(e));
            }
        };
        if let Err(e) = engine.apply(parsed) {
            error!(error = %e, "router conf apply failed");
            return Ok(Delivery::Rejected(e));
        }

        Ok(Delivery::Applied { bytes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_shm::StoreOptions;
    use std::io::{Read, Write};

    /// Engine that records what it was asked to apply.
    #[derive(Default)]
    struct Recorder {
        applied: Vec<Vec<u8>>,
        refuse_apply: bool,
    }

    impl ConfigEngine for Recorder {
        type Parsed = Vec<u8>;

        fn parse(&self, bytes: &[u8]) -> Result<Self::Parsed, EngineError> {
            if bytes.first() == Some(&b'{') {
                Ok(bytes.to_vec())
            } else {
                Err(EngineError::Parse("not an object".into()))
            }
        }

        fn apply(&mut self, parsed: Self::Parsed) -> Result<(), EngineError> {
            if self.refuse_apply {
                return Err(EngineError::Apply("refused".into()));
            }
            self.applied.push(parsed);
            Ok(())
        }
    }

    /// Delivers queued chunks, one per `read`.
    struct Inbox(std::collections::VecDeque<io::Result<Vec<u8>>>);

    impl Read for Inbox {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.pop_front() {
                None => Err(io::ErrorKind::WouldBlock.into()),
                Some(Err(e)) => Err(e),
                Some(Ok(chunk)) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
            }
        }
    }

    impl Write for Inbox {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn frame() -> Vec<u8> {
        NotificationFrame::config_changed().encode().to_vec()
    }

    fn store(dir: &tempfile::TempDir, blob: &[u8], refs: u64) -> ConfigStore {
        let s = ConfigStore::create(dir.path().join("store"), StoreOptions::default()).unwrap();
        s.install_with_readers(blob, refs).unwrap();
        s
    }

    #[test]
    fn good_frame_applies_the_current_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, br#"{"a":1}"#, 1);
        let mut inbox = Inbox(vec![Ok(frame())].into());
        let mut engine = Recorder::default();
        let mut m = ReceiveMachine::new();

        let out = m.on_read_ready(&mut inbox, &store, &mut engine).unwrap();
        assert_eq!(out, Delivery::Applied { bytes: 7 });
        assert_eq!(engine.applied, vec![br#"{"a":1}"#.to_vec()]);
        assert_eq!(store.refcount(), 0);
    }

    #[test]
    fn would_block_is_not_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, b"{}", 1);
        let mut inbox = Inbox(Default::default());
        let mut m = ReceiveMachine::new();

        let out = m
            .on_read_ready(&mut inbox, &store, &mut Recorder::default())
            .unwrap();
        assert_eq!(out, Delivery::Idle);
        assert_eq!(store.refcount(), 1);
    }

    #[test]
    fn malformed_frames_release_and_leave_the_connection_usable() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, b"{}", 3);

        let mut oversized = frame();
        oversized.extend_from_slice(&[0, 0]);
        let mut unknown = frame();
        unknown[4] = 7;

        let mut inbox = Inbox(vec![Ok(frame()[..4].to_vec()), Ok(oversized), Ok(unknown), Ok(frame())].into());
        let mut engine = Recorder::default();
        let mut m = ReceiveMachine::new();

        let short = m.on_read_ready(&mut inbox, &store, &mut engine).unwrap_err();
        assert!(matches!(short, RecvFailure::Frame(FrameError::ShortFrame { received: 4 })));
        let mismatch = m.on_read_ready(&mut inbox, &store, &mut engine).unwrap_err();
        assert!(matches!(mismatch, RecvFailure::Frame(FrameError::SizeMismatch { .. })));
        let unknown = m.on_read_ready(&mut inbox, &store, &mut engine).unwrap_err();
        assert!(matches!(unknown, RecvFailure::Frame(FrameError::UnknownType(7))));

        assert!(engine.applied.is_empty());
        assert_eq!(store.refcount(), 0);

        // A later write finds the same connection still working.
        store.install_with_readers(br#"{"v":2}"#, 1).unwrap();
        let out = m.on_read_ready(&mut inbox, &store, &mut engine).unwrap();
        assert_eq!(out, Delivery::Applied { bytes: 7 });
    }

    #[test]
    fn closed_peer_releases() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, b"{}", 1);
        let mut inbox = Inbox(vec![Ok(Vec::new())].into());

        let err = ReceiveMachine::new()
            .on_read_ready(&mut inbox, &store, &mut Recorder::default())
            .unwrap_err();
        assert!(matches!(err, RecvFailure::Closed));
        assert_eq!(store.refcount(), 0);
    }

    #[test]
    fn engine_failures_keep_the_previous_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, b"not json", 2);
        let mut inbox = Inbox(vec![Ok(frame()), Ok(frame())].into());
        let mut engine = Recorder::default();
        let mut m = ReceiveMachine::new();

        let out = m.on_read_ready(&mut inbox, &store, &mut engine).unwrap();
        assert!(matches!(out, Delivery::Rejected(EngineError::Parse(_))));

        store.install(b"{}").unwrap();
        engine.refuse_apply = true;
        let out = m.on_read_ready(&mut inbox, &store, &mut engine).unwrap();
        assert!(matches!(out, Delivery::Rejected(EngineError::Apply(_))));

        // Snapshots were still taken, so both references are gone.
        assert!(engine.applied.is_empty());
        assert_eq!(store.refcount(), 0);
    }
}
