//! First-fit block allocator over a byte range of the shared mapping.
//!
//! Blocks are laid out back to back and addressed by their offset from the
//! start of the arena, so the same offset is valid in every process no matter
//! where the mapping landed. Each block starts with a `BlockHeader`; the
//! payload follows immediately.
//!
//! ```text
//! arena start
//! ┌──────────────┬──────────────┬──────────────┬─────────────────────┐
//! │ block (used) │ block (free) │ block (used) │ block (free) ...    │
//! └──────────────┴──────────────┴──────────────┴─────────────────────┘
//!   ┌────────┬────────┬────────┬────────┬─────────────────────┐
//!   │ size   │ state  │ len    │ next   │ payload (len bytes) │
//!   └────────┴────────┴────────┴────────┴─────────────────────┘
//! ```
//!
//! The store only ever has a handful of blocks alive (the current blob plus
//! superseded ones still being read), so a linear walk is cheaper than any
//! index structure would be to maintain. Free blocks are coalesced with their
//! free neighbours on every `free`.
//!
//! Every method assumes the caller holds the store mutex.

use std::mem::size_of;

/// Sentinel for "no block".
pub const NIL: u64 = u64::MAX;

/// Block sizes are multiples of this. Must be a power of 2.
pub const BLOCK_ALIGN: u64 = 16;

const STATE_FREE: u64 = 0x4652_4545; // "FREE"
const STATE_USED: u64 = 0x5553_4544; // "USED"

#[repr(C)]
struct BlockHeader {
    /// Total block size including this header.
    size: u64,
    /// `STATE_FREE` or `STATE_USED`; anything else means corruption.
    state: u64,
    /// Payload bytes in use.
    len: u64,
    /// Intrusive link used by the store's retired list.
    next: u64,
}

pub const BLOCK_HEADER: u64 = size_of::<BlockHeader>() as u64;

/// Smallest block worth splitting off.
pub const MIN_BLOCK: u64 = BLOCK_HEADER + BLOCK_ALIGN;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ArenaError {
    #[error("arena exhausted: {requested} bytes requested, largest free block holds {largest}")]
    OutOfMemory { requested: u64, largest: u64 },

    #[error("block at offset {0} is already free")]
    DoubleFree(u64),

    #[error("offset {0} does not address a block")]
    InvalidBlock(u64),

    #[error("arena corrupted at offset {0}")]
    Corrupt(u64),
}

/// Rounds `n` up to the next multiple of `BLOCK_ALIGN`.
///
/// ```text
/// 0 → 0, 1 → 16, 16 → 16, 17 → 32
/// ```
#[inline(always)]
pub fn align_up(n: u64) -> u64 {
    (n + BLOCK_ALIGN - 1) & !(BLOCK_ALIGN - 1)
}

/// Live usage figures, gathered by walking the arena.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaUsage {
    pub used_blocks: u64,
    pub used_bytes: u64,
    pub free_blocks: u64,
    pub largest_free: u64,
}

/// A view over the arena region. Holds no state of its own.
pub struct Arena {
    base: *mut u8,
    size: u64,
}

impl Arena {
    /// # Safety
    /// `base` must point to `size` writable bytes of the shared mapping that
    /// stay mapped for the life of this view, aligned to `BLOCK_ALIGN`.
    pub unsafe fn new(base: *mut u8, size: u64) -> Self {
        Self {
            base,
            size: size & !(BLOCK_ALIGN - 1),
        }
    }

    /// Turns the whole region into one free block.
    pub fn format(&mut self) {
        let size = self.size;
        let h = self.header_mut(0);
        h.size = size;
        h.state = STATE_FREE;
        h.len = 0;
        h.next = NIL;
    }

    #[inline(always)]
    fn header(&self, off: u64) -> &BlockHeader {
        // SAFETY: callers only pass offsets produced by walking the block chain
        // or validated by `check_used`, both of which stay inside the region.
        unsafe { &*(self.base.add(off as usize) as *const BlockHeader) }
    }

    #[inline(always)]
    fn header_mut(&mut self, off: u64) -> &mut BlockHeader {
        // SAFETY: see `header`.
        unsafe { &mut *(self.base.add(off as usize) as *mut BlockHeader) }
    }

    /// Iterates `(offset, size, state)` over every block, stopping at the
    /// first malformed header.
    fn walk(&self) -> impl Iterator<Item = Result<(u64, u64, u64), ArenaError>> + '_ {
        let mut off = 0u64;
        let mut broken = false;
        std::iter::from_fn(move || {
            if broken || off >= self.size {
                return None;
            }
            let h = self.header(off);
            let bad_size = h.size < BLOCK_HEADER || h.size % BLOCK_ALIGN != 0;
            let bad_state = h.state != STATE_FREE && h.state != STATE_USED;
            if bad_size || bad_state || off + h.size > self.size {
                broken = true;
                return Some(Err(ArenaError::Corrupt(off)));
            }
            let item = (off, h.size, h.state);
            off += h.size;
            Some(Ok(item))
        })
    }

    /// Allocates a block able to hold `len` payload bytes.
    pub fn alloc(&mut self, len: u64) -> Result<u64, ArenaError> {
        let need = align_up(BLOCK_HEADER + len);
        let mut largest = 0u64;
        let mut found = None;

        for block in self.walk() {
            let (off, size, state) = block?;
            if state != STATE_FREE {
                continue;
            }
            if size >= need {
                found = Some((off, size));
                break;
            }
            largest = largest.max(size.saturating_sub(BLOCK_HEADER));
        }

        let Some((off, size)) = found else {
            return Err(ArenaError::OutOfMemory {
                requested: len,
                largest,
            });
        };

        if size - need >= MIN_BLOCK {
            let rest = self.header_mut(off + need);
            rest.size = size - need;
            rest.state = STATE_FREE;
            rest.len = 0;
            rest.next = NIL;
            self.header_mut(off).size = need;
        }

        let h = self.header_mut(off);
        h.state = STATE_USED;
        h.len = len;
        h.next = NIL;
        Ok(off)
    }

    fn check_used(&self, off: u64) -> Result<(), ArenaError> {
        // Offsets handed out by `alloc` are always on a block boundary, so
        // anything else is rejected before touching memory.
        for block in self.walk() {
            let (b, _, state) = block?;
            if b == off {
                return if state == STATE_USED {
                    Ok(())
                } else {
                    Err(ArenaError::DoubleFree(off))
                };
            }
            if b > off {
                break;
            }
        }
        Err(ArenaError::InvalidBlock(off))
    }

    /// Returns a block to the free pool and merges adjacent free blocks.
    pub fn free(&mut self, off: u64) -> Result<(), ArenaError> {
        self.check_used(off)?;
        let h = self.header_mut(off);
        h.state = STATE_FREE;
        h.len = 0;
        h.next = NIL;
        self.coalesce()
    }

    fn coalesce(&mut self) -> Result<(), ArenaError> {
        let mut off = 0u64;
        while off < self.size {
            let (size, state) = {
                let h = self.header(off);
                (h.size, h.state)
            };
            if size == 0 {
                return Err(ArenaError::Corrupt(off));
            }
            let next = off + size;
            if state == STATE_FREE && next < self.size && self.header(next).state == STATE_FREE {
                let absorbed = self.header(next).size;
                self.header_mut(off).size = size + absorbed;
                // Stay on `off`: the grown block may touch another free one.
                continue;
            }
            off = next;
        }
        Ok(())
    }

    /// Payload pointer of a used block.
    #[inline(always)]
    pub fn payload(&self, off: u64) -> *mut u8 {
        // SAFETY: offset is a used block inside the region.
        unsafe { self.base.add((off + BLOCK_HEADER) as usize) }
    }

    #[inline(always)]
    pub fn payload_len(&self, off: u64) -> u64 {
        self.header(off).len
    }

    #[inline(always)]
    pub fn next(&self, off: u64) -> u64 {
        self.header(off).next
    }

    #[inline(always)]
    pub fn set_next(&mut self, off: u64, next: u64) {
        self.header_mut(off).next = next;
    }

    pub fn usage(&self) -> Result<ArenaUsage, ArenaError> {
        let mut u = ArenaUsage::default();
        for block in self.walk() {
            let (off, size, state) = block?;
            if state == STATE_USED {
                u.used_blocks += 1;
                u.used_bytes += self.payload_len(off);
            } else {
                u.free_blocks += 1;
                u.largest_free = u.largest_free.max(size - BLOCK_HEADER);
            }
        }
        Ok(u)
    }
}
