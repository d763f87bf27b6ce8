//! Shared memory layout of the configuration store.
//!
//! The mapped file starts with a `StoreHeader`, followed by the arena that
//! holds the configuration blobs. The layout is identical in every process
//! that maps the file; all cross-references inside it are arena offsets.
//!
//! # Memory Layout
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                        StoreHeader                             │
//! │  ┌────────┬─────────┬──────────┬──────────────┬────────────┐   │
//! │  │ magic  │ version │ map_size │ arena_offset │ arena_size │   │
//! │  └────────┴─────────┴──────────┴──────────────┴────────────┘   │
//! │  ┌──────────────────────────────────────────────────────────┐  │
//! │  │ lock: ShmMutex (one cache line)                          │  │
//! │  └──────────────────────────────────────────────────────────┘  │
//! │  ┌──────────────────────────────────────────────────────────┐  │
//! │  │ state: current, refcount, retired, settled, counters     │  │
//! │  └──────────────────────────────────────────────────────────┘  │
//! ├────────────────────────────────────────────────────────────────┤
//! │                          Arena                                 │
//! │              (blocks addressed by offset, see arena.rs)        │
//! └────────────────────────────────────────────────────────────────┘
//! ```

use crate::arena::{BLOCK_ALIGN, BLOCK_HEADER, align_up};
use crate::shmtx::ShmMutex;
use std::cell::UnsafeCell;
use std::mem::size_of;

/// Magic number identifying a configuration store file.
///
/// ASCII "BASALTCF": `0x4241_5341_4C54_4346`.
pub const STORE_MAGIC: u64 = 0x4241_5341_4C54_4346;

/// Current store format version.
///
/// Increment this when making incompatible changes to the layout.
pub const STORE_VERSION: u64 = 2;

/// State guarded by `StoreHeader::lock`. Never touched without it.
#[repr(C)]
pub struct StoreState {
    /// Arena offset of the current blob, or `arena::NIL`.
    pub current: u64,
    /// Byte length of the current blob.
    pub length: u64,
    /// Notifications issued but not yet consumed or compensated.
    pub refcount: u64,
    /// Head of the list of superseded blobs still waiting for readers.
    pub retired: u64,
    /// Blob that was current when the counter last reached zero. Not
    /// reference counted; kept for workers that start later and freed by
    /// the next install.
    pub settled: u64,
    pub settled_length: u64,
    /// Bumped on every successful install.
    pub generation: u64,
    pub installs: u64,
    pub frees: u64,
}

/// Header at offset 0 of every store file.
#[repr(C)]
pub struct StoreHeader {
    /// Must equal `STORE_MAGIC`.
    pub magic: u64,
    /// Must equal `STORE_VERSION`.
    pub version: u64,
    /// Total mapped bytes, checked against the file size on attach.
    pub map_size: u64,
    /// Byte offset of the arena from the start of the mapping.
    pub arena_offset: u64,
    /// Usable arena bytes.
    pub arena_size: u64,

    pub lock: ShmMutex,
    pub state: UnsafeCell<StoreState>,
}

impl StoreHeader {
    /// Validates a header found in an existing mapping of `mapped` bytes.
    pub fn validate(&self, mapped: usize) -> Result<(), &'static str> {
        if self.magic != STORE_MAGIC {
            return Err("Bad magic");
        }
        if self.version != STORE_VERSION {
            return Err("Wrong version");
        }
        if self.map_size as usize != mapped {
            return Err("Mapped size does not match header");
        }
        if self.arena_offset != arena_offset() {
            return Err("Arena offset mismatch");
        }
        if self.arena_offset + self.arena_size > self.map_size {
            return Err("Arena extends past the mapping");
        }
        Ok(())
    }
}

/// Byte offset at which the arena begins.
#[inline]
pub fn arena_offset() -> u64 {
    align_up(size_of::<StoreHeader>() as u64)
}

/// Total bytes to map for an arena of `arena_size` usable bytes.
pub fn bytes_for_store(arena_size: u64) -> usize {
    (arena_offset() + (arena_size & !(BLOCK_ALIGN - 1))) as usize
}

/// Smallest arena that can hold one empty blob.
pub const MIN_ARENA: u64 = BLOCK_HEADER;
