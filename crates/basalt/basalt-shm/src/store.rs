//! Reference-counted configuration blob in shared memory.
//!
//! One process installs a new blob, every worker that gets notified takes one
//! reference, and each reference is dropped either by the receiver copying the
//! blob out (`snapshot_and_release`) or by the sender compensating for a
//! notification that never left (`release`).
//!
//! # Lifecycle
//!
//! ```text
//!  install_with_readers(A, 3)       snapshot_and_release ×3
//!  ─────────────────────────▶ A(rc=3) ───────────────────────▶ freed
//!
//!  install(B) while A(rc>0): A moves to the retired list, B becomes current.
//!  When the counter next reaches zero all retired blobs are freed and the
//!  current one becomes the settled copy.
//! ```
//!
//! The settled copy is what a worker started after the last delivery reads
//! through `snapshot`. It holds no references and the next install frees it.
//!
//! # Thread Safety
//! Every read or write of `StoreState` and of arena blocks happens inside the
//! shared mutex, so a `ConfigStore` can be used from any thread of any process
//! that maps the file.

use crate::arena::{Arena, ArenaError, ArenaUsage, NIL};
use crate::shm_layout::{
    MIN_ARENA, STORE_MAGIC, STORE_VERSION, StoreHeader, StoreState, arena_offset, bytes_for_store,
};
use crate::shmtx::DEFAULT_SPIN;
use basalt_mmap::SharedMap;
use std::io;
use std::path::Path;
use std::ptr;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store io failed")]
    Io(#[from] io::Error),

    #[error("invalid store layout: {0}")]
    InvalidLayout(&'static str),

    #[error("out of shared memory installing {requested} bytes")]
    OutOfMemory {
        requested: u64,
        #[source]
        source: ArenaError,
    },

    #[error("no configuration blob is installed")]
    Empty,

    #[error("shared arena failure")]
    Arena(#[from] ArenaError),
}

/// Creation parameters for a new store file.
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// Usable arena bytes. Must fit two full payloads, since a new blob is
    /// allocated before the one it replaces is released.
    pub arena_size: u64,
    /// Lock spin budget before yielding (see `ShmMutex::lock`).
    pub spin: u32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            arena_size: 1 << 20,
            spin: DEFAULT_SPIN,
        }
    }
}

/// What happened to the blob that `install` replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Superseded {
    /// There was no previous blob.
    Nothing,
    /// The previous blob had no readers and was freed right away.
    Freed,
    /// The previous blob still had readers; it is freed on the last release.
    Retired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallReport {
    pub generation: u64,
    pub length: u64,
    /// Reference count right after the install.
    pub refcount: u64,
    pub superseded: Superseded,
}

/// Result of dropping one reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// References remain outstanding.
    Remaining(u64),
    /// That was the last reference: retired blobs were freed and the current
    /// blob became the settled copy.
    Freed,
    /// No reference was outstanding. Nothing changed.
    Underflow,
}

/// Point-in-time view of the store, taken under the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub generation: u64,
    pub refcount: u64,
    pub length: u64,
    pub has_blob: bool,
    pub has_settled: bool,
    pub retired: u64,
    pub installs: u64,
    pub frees: u64,
    pub arena: ArenaUsage,
}

/// Handle on a mapped configuration store.
pub struct ConfigStore {
    map: SharedMap,
    base: *mut u8,
    pid: u64,
    spin: u32,
}

// SAFETY: `base` points into `map`, which lives as long as the handle and
// never moves. All mutation of the pointed-to memory is serialized by the
// shared mutex, which also orders it across threads.
unsafe impl Send for ConfigStore {}
unsafe impl Sync for ConfigStore {}

/// Exclusive access to the store state, released on drop.
struct Locked<'a> {
    store: &'a ConfigStore,
}

impl Locked<'_> {
    fn state(&mut self) -> &mut StoreState {
        // SAFETY: we hold the shared mutex.
        unsafe { &mut *self.store.header().state.get() }
    }

    fn arena(&self) -> Arena {
        let h = self.store.header();
        // SAFETY: offset and size were validated against the mapping on
        // create/open, and the arena start is block aligned.
        unsafe { Arena::new(self.store.base.add(h.arena_offset as usize), h.arena_size) }
    }
}

impl Drop for Locked<'_> {
    fn drop(&mut self) {
        self.store.header().lock.unlock(self.store.pid);
    }
}

impl ConfigStore {
    /// Creates a fresh store file at `path`, replacing any existing one.
    ///
    /// Must run before any worker opens the file.
    pub fn create<P: AsRef<Path>>(path: P, opts: StoreOptions) -> Result<Self, StoreError> {
        if opts.arena_size < MIN_ARENA {
            return Err(StoreError::InvalidLayout("Arena too small"));
        }
        let bytes = bytes_for_store(opts.arena_size);
        let mut map = SharedMap::create(path, bytes)?;
        let base = map.as_mut_ptr();

        // SAFETY: the file was just created and sized by us; no other process
        // has it mapped yet.
        unsafe {
            let h = base as *mut StoreHeader;
            ptr::addr_of_mut!((*h).magic).write(STORE_MAGIC);
            ptr::addr_of_mut!((*h).version).write(STORE_VERSION);
            ptr::addr_of_mut!((*h).map_size).write(bytes as u64);
            ptr::addr_of_mut!((*h).arena_offset).write(arena_offset());
            ptr::addr_of_mut!((*h).arena_size).write(bytes as u64 - arena_offset());
            (*h).lock.init();
            ptr::write(
                (*h).state.get(),
                StoreState {
                    current: NIL,
                    length: 0,
                    refcount: 0,
                    retired: NIL,
                    settled: NIL,
                    settled_length: 0,
                    generation: 0,
                    installs: 0,
                    frees: 0,
                },
            );
        }

        let store = Self::from_map(map, base, opts.spin);
        store.lock().arena().format();

        debug!(
            path = %store.map.path().display(),
            bytes,
            "config store created"
        );
        Ok(store)
    }

    /// Maps an existing store created by another process.
    pub fn open<P: AsRef<Path>>(path: P, spin: u32) -> Result<Self, StoreError> {
        let mut map = SharedMap::open(path)?;
        let base = map.as_mut_ptr();

        if map.len() < arena_offset() as usize {
            return Err(StoreError::InvalidLayout("File smaller than header"));
        }
        // SAFETY: the mapping covers a whole header; `validate` checks it
        // against the mapped size before anything else is trusted.
        let h = unsafe { &*(base as *const StoreHeader) };
        h.validate(map.len()).map_err(StoreError::InvalidLayout)?;

        Ok(Self::from_map(map, base, spin))
    }

    fn from_map(map: SharedMap, base: *mut u8, spin: u32) -> Self {
        Self {
            map,
            base,
            pid: std::process::id() as u64,
            spin,
        }
    }

    #[inline(always)]
    fn header(&self) -> &StoreHeader {
        // SAFETY: base points to a validated StoreHeader
        unsafe { &*(self.base as *const StoreHeader) }
    }

    fn lock(&self) -> Locked<'_> {
        self.header().lock.lock(self.pid, self.spin);
        Locked { store: self }
    }

    pub fn path(&self) -> &Path {
        self.map.path()
    }

    /// Replaces the current blob with a copy of `data`.
    ///
    /// The new block is allocated before the old one is touched: if the
    /// arena is exhausted the previous blob stays current and intact.
    pub fn install(&self, data: &[u8]) -> Result<InstallReport, StoreError> {
        self.install_with_readers(data, 0)
    }

    /// `install` plus `readers` references taken in the same critical section,
    /// so the last release of an earlier round can never observe the new blob
    /// with no references on it.
    pub fn install_with_readers(&self, data: &[u8], readers: u64) -> Result<InstallReport, StoreError> {
        let mut g = self.lock();
        let mut arena = g.arena();

        let off = arena
            .alloc(data.len() as u64)
            .map_err(|source| match source {
                ArenaError::OutOfMemory { .. } => StoreError::OutOfMemory {
                    requested: data.len() as u64,
                    source,
                },
                other => StoreError::Arena(other),
            })?;

        // SAFETY: the block was just allocated with room for `data.len()` bytes.
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), arena.payload(off), data.len()) };

        let st = g.state();
        let superseded = if st.current == NIL {
            Superseded::Nothing
        } else if st.refcount == 0 {
            arena.free(st.current)?;
            st.frees += 1;
            Superseded::Freed
        } else {
            arena.set_next(st.current, st.retired);
            st.retired = st.current;
            Superseded::Retired
        };

        if st.settled != NIL {
            arena.free(st.settled)?;
            st.frees += 1;
            st.settled = NIL;
            st.settled_length = 0;
        }

        st.current = off;
        st.length = data.len() as u64;
        st.refcount += readers;
        st.generation += 1;
        st.installs += 1;

        debug!(
            generation = st.generation,
            length = st.length,
            refcount = st.refcount,
            ?superseded,
            "config blob installed"
        );

        Ok(InstallReport {
            generation: st.generation,
            length: st.length,
            refcount: st.refcount,
            superseded,
        })
    }

    /// Copies the current blob into `out` and drops one reference, in a single
    /// critical section.
    ///
    /// `out` is cleared first. On `Empty` nothing is released: a reference
    /// can only exist while a blob does.
    pub fn snapshot_and_release_into(&self, out: &mut Vec<u8>) -> Result<Release, StoreError> {
        let mut g = self.lock();
        let arena = g.arena();
        let st = g.state();

        if st.current == NIL {
            return Err(StoreError::Empty);
        }

        out.clear();
        out.reserve(st.length as usize);
        // SAFETY: `current` is a used block holding `length` bytes, and `out`
        // has at least that much spare capacity.
        unsafe {
            ptr::copy_nonoverlapping(arena.payload(st.current), out.as_mut_ptr(), st.length as usize);
            out.set_len(st.length as usize);
        }

        Self::locked_release(&mut g)
    }

    /// Convenience wrapper returning a fresh buffer.
    pub fn snapshot_and_release(&self) -> Result<Vec<u8>, StoreError> {
        let mut out = Vec::new();
        self.snapshot_and_release_into(&mut out)?;
        Ok(out)
    }

    /// Copies the current blob, or the settled copy when no blob is current,
    /// without touching the reference count.
    ///
    /// Used by a worker at start-up to pick up the latest configuration.
    pub fn snapshot(&self) -> Option<Vec<u8>> {
        let mut g = self.lock();
        let arena = g.arena();
        let st = g.state();
        let (off, len) = if st.current != NIL {
            (st.current, st.length)
        } else if st.settled != NIL {
            (st.settled, st.settled_length)
        } else {
            return None;
        };
        // SAFETY: `off` is a used block holding `len` bytes.
        let bytes = unsafe { std::slice::from_raw_parts(arena.payload(off), len as usize).to_vec() };
        Some(bytes)
    }

    /// Drops one reference without copying.
    pub fn release(&self) -> Release {
        let mut g = self.lock();
        match Self::locked_release(&mut g) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "config blob release hit a damaged arena");
                Release::Remaining(g.state().refcount)
            }
        }
    }

    fn locked_release(g: &mut Locked<'_>) -> Result<Release, StoreError> {
        let mut arena = g.arena();
        let st = g.state();

        if st.refcount == 0 {
            warn!(generation = st.generation, "config blob released with no outstanding reference");
            return Ok(Release::Underflow);
        }

        st.refcount -= 1;
        if st.refcount > 0 {
            return Ok(Release::Remaining(st.refcount));
        }

        // Last reader gone: return every retired blob and settle the current one.
        while st.retired != NIL {
            let next = arena.next(st.retired);
            arena.free(st.retired)?;
            st.frees += 1;
            st.retired = next;
        }
        if st.current != NIL {
            if st.settled != NIL {
                arena.free(st.settled)?;
                st.frees += 1;
            }
            st.settled = st.current;
            st.settled_length = st.length;
            st.current = NIL;
            st.length = 0;
        }

        debug!(generation = st.generation, "config blob settled");
        Ok(Release::Freed)
    }

    /// Outstanding references. This is the write gate's counter.
    pub fn refcount(&self) -> u64 {
        let mut g = self.lock();
        g.state().refcount
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let mut g = self.lock();
        let arena = g.arena();
        let usage = arena.usage()?;
        let st = g.state();

        let mut retired = 0u64;
        let mut off = st.retired;
        while off != NIL {
            retired += 1;
            off = arena.next(off);
        }

        Ok(StoreStats {
            generation: st.generation,
            refcount: st.refcount,
            length: st.length,
            has_blob: st.current != NIL,
            has_settled: st.settled != NIL,
            retired,
            installs: st.installs,
            frees: st.frees,
            arena: usage,
        })
    }

    /// Breaks the store lock if a dead process still holds it.
    pub fn force_unlock(&self, dead_pid: u64) -> bool {
        let broke = self.header().lock.force_unlock(dead_pid);
        if broke {
            warn!(pid = dead_pid, "config store lock held by exited process was released");
        }
        broke
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_store(dir: &tempfile::TempDir, arena_size: u64) -> ConfigStore {
        ConfigStore::create(
            dir.path().join("store"),
            StoreOptions {
                arena_size,
                spin: 16,
            },
        )
        .unwrap()
    }

    #[test]
    fn install_then_snapshot_round_trips_the_payload() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_store(&dir, 4096);
        let payload = br#"{"listeners":{"*:80":{"pass":"routes"}}}"#;

        store.install_with_readers(payload, 1).unwrap();

        assert_eq!(store.snapshot_and_release().unwrap(), payload.to_vec());
        let stats = store.stats().unwrap();
        assert_eq!(stats.refcount, 0);
        assert!(!stats.has_blob);
        assert!(stats.has_settled);
        assert_eq!(stats.frees, 0);
    }

    #[test]
    fn settled_copy_serves_late_starters_until_the_next_install() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_store(&dir, 4096);

        store.install_with_readers(b"v1", 2).unwrap();
        store.snapshot_and_release().unwrap();
        assert_eq!(store.release(), Release::Freed);

        // Nothing is outstanding, yet a new worker still finds v1.
        assert!(matches!(store.snapshot_and_release(), Err(StoreError::Empty)));
        assert_eq!(store.snapshot().unwrap(), b"v1".to_vec());
        assert_eq!(store.stats().unwrap().arena.used_blocks, 1);

        let report = store.install(b"v2").unwrap();
        assert_eq!(report.superseded, Superseded::Nothing);
        let stats = store.stats().unwrap();
        assert!(!stats.has_settled);
        assert_eq!(stats.arena.used_blocks, 1);
        assert_eq!(stats.frees, 1);
        assert_eq!(store.snapshot().unwrap(), b"v2".to_vec());
    }

    #[test]
    fn out_of_memory_keeps_the_settled_copy() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_store(&dir, 256);

        store.install_with_readers(b"keep me", 1).unwrap();
        store.snapshot_and_release().unwrap();
        assert!(store.install(&[0u8; 512]).is_err());
        assert_eq!(store.snapshot().unwrap(), b"keep me".to_vec());
    }

    #[test]
    fn back_to_back_installs_without_readers_free_the_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_store(&dir, 4096);

        let first = store.install(b"first").unwrap();
        assert_eq!(first.superseded, Superseded::Nothing);
        let second = store.install(b"second").unwrap();
        assert_eq!(second.superseded, Superseded::Freed);
        assert_eq!(second.generation, 2);

        let stats = store.stats().unwrap();
        assert_eq!(stats.arena.used_blocks, 1);
        assert_eq!(stats.installs, 2);
        assert_eq!(stats.frees, 1);
    }

    #[test]
    fn install_retires_a_referenced_blob_until_the_last_release() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_store(&dir, 4096);

        store.install_with_readers(b"old", 2).unwrap();

        let report = store.install(b"new").unwrap();
        assert_eq!(report.superseded, Superseded::Retired);
        assert_eq!(store.stats().unwrap().arena.used_blocks, 2);

        // Readers always see the most recent completed write.
        assert_eq!(store.snapshot_and_release().unwrap(), b"new".to_vec());
        assert_eq!(store.stats().unwrap().retired, 1);

        assert_eq!(store.release(), Release::Freed);
        let stats = store.stats().unwrap();
        assert_eq!(stats.arena.used_blocks, 1);
        assert_eq!(stats.frees, 1);
        assert_eq!(stats.retired, 0);
        assert_eq!(store.snapshot().unwrap(), b"new".to_vec());
    }

    #[test]
    fn out_of_memory_keeps_the_previous_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_store(&dir, 256);

        store.install(b"keep me").unwrap();
        let err = store.install(&[0u8; 512]).unwrap_err();
        assert!(matches!(err, StoreError::OutOfMemory { requested: 512, .. }));

        assert_eq!(store.snapshot().unwrap(), b"keep me".to_vec());
        assert_eq!(store.stats().unwrap().generation, 1);
    }

    #[test]
    fn release_without_reference_is_reported_not_applied() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_store(&dir, 1024);

        store.install(b"x").unwrap();
        assert_eq!(store.release(), Release::Underflow);
        assert!(store.stats().unwrap().has_blob);
    }

    #[test]
    fn snapshot_of_empty_store_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_store(&dir, 1024);
        assert!(matches!(store.snapshot_and_release(), Err(StoreError::Empty)));
        assert!(store.snapshot().is_none());
    }

    #[test]
    fn second_handle_sees_the_same_blob() {
        let dir = tempfile::tempdir().unwrap();
        let writer = small_store(&dir, 4096);
        let reader = ConfigStore::open(writer.path(), 16).unwrap();

        writer.install_with_readers(b"shared", 1).unwrap();
        assert_eq!(reader.refcount(), 1);
        assert_eq!(reader.snapshot_and_release().unwrap(), b"shared".to_vec());
        assert_eq!(writer.refcount(), 0);
    }

    #[test]
    fn open_rejects_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk");
        std::fs::write(&path, vec![7u8; 4096]).unwrap();

        assert!(matches!(
            ConfigStore::open(&path, 16),
            Err(StoreError::InvalidLayout("Bad magic"))
        ));
    }
}
