//! Cross-process spin mutex stored inside the shared mapping.
//!
//! A single atomic lock word lives in the mapped file, so every process that
//! maps the file contends on the same word. Locking never parks the thread in
//! the kernel: it spins with exponential backoff and yields the CPU between
//! rounds. Critical sections are bounded by a memcpy of the configuration
//! blob.
//!
//! # Protocol
//!
//! **Lock word:**
//! - `0`: free
//! - anything else: the pid of the owning process
//!
//! **Acquire:** CAS `0 -> pid` with `Acquire` ordering.
//!
//! **Release:** CAS `pid -> 0` with `Release` ordering. Storing the pid lets
//! the master process break a lock left behind by a worker that died inside a
//! critical section (`force_unlock`).
//!
//! # Memory Layout
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │  owner: AtomicU64  │  padding to 64B     │
//! └──────────────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Default number of spin rounds before yielding the CPU.
pub const DEFAULT_SPIN: u32 = 2048;

/// A mutex whose state lives entirely in shared memory.
///
/// Aligned to a cache line so the lock word never shares a line with the
/// data it protects.
#[repr(C, align(64))]
pub struct ShmMutex {
    owner: AtomicU64,
}

impl ShmMutex {
    /// Resets the lock word. Only the creator of the mapping calls this,
    /// before any other process can see the region.
    #[inline(always)]
    pub fn init(&mut self) {
        self.owner.store(0, Ordering::Relaxed);
    }

    /// One acquisition attempt.
    #[inline(always)]
    pub fn try_lock(&self, pid: u64) -> bool {
        debug_assert!(pid != 0, "pid 0 is the free marker");
        self.owner
            .compare_exchange(0, pid, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Acquires the lock, spinning with doubling backoff up to `spin`
    /// iterations and then yielding.
    ///
    /// On a single-CPU host spinning only burns the owner's time slice, so
    /// pass `spin = 0` there to go straight to yielding.
    pub fn lock(&self, pid: u64, spin: u32) {
        loop {
            // Test before test-and-set keeps the line shared while contended
            if self.owner.load(Ordering::Relaxed) == 0 && self.try_lock(pid) {
                return;
            }

            let mut n = 1u32;
            while n < spin {
                for _ in 0..n {
                    std::hint::spin_loop();
                }
                if self.owner.load(Ordering::Relaxed) == 0 && self.try_lock(pid) {
                    return;
                }
                n <<= 1;
            }

            std::thread::yield_now();
        }
    }

    /// Releases a lock held by `pid`. Returns `false` if `pid` was not the owner.
    #[inline(always)]
    pub fn unlock(&self, pid: u64) -> bool {
        self.owner
            .compare_exchange(pid, 0, Ordering::Release, Ordering::Relaxed)
            .is_ok()
    }

    /// Breaks the lock if it is still held by `dead_pid`.
    ///
    /// Called by the master after reaping a worker. The protected state may be
    /// mid-update; the store's critical sections keep every field consistent
    /// at each store, so a torn section only ever leaks a block.
    pub fn force_unlock(&self, dead_pid: u64) -> bool {
        self.unlock(dead_pid)
    }

    /// Current owner pid, if locked. Only meaningful for diagnostics.
    pub fn owner(&self) -> Option<u64> {
        match self.owner.load(Ordering::Relaxed) {
            0 => None,
            pid => Some(pid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, size_of};
    use std::sync::Arc;

    fn fresh() -> ShmMutex {
        ShmMutex {
            owner: AtomicU64::new(0),
        }
    }

    #[test]
    fn mutex_occupies_one_cache_line() {
        assert_eq!(size_of::<ShmMutex>(), 64);
        assert_eq!(align_of::<ShmMutex>(), 64);
    }

    #[test]
    fn only_the_owner_can_unlock() {
        let m = fresh();
        assert!(m.try_lock(7));
        assert!(!m.try_lock(8));
        assert!(!m.unlock(8));
        assert_eq!(m.owner(), Some(7));
        assert!(m.unlock(7));
        assert_eq!(m.owner(), None);
    }

    #[test]
    fn force_unlock_breaks_a_dead_owner() {
        let m = fresh();
        m.lock(42, DEFAULT_SPIN);
        assert!(!m.force_unlock(41));
        assert!(m.force_unlock(42));
        assert!(m.try_lock(43));
    }

    #[test]
    fn lock_excludes_concurrent_increments() {
        struct Shared {
            m: ShmMutex,
            value: std::cell::UnsafeCell<u64>,
        }
        unsafe impl Sync for Shared {}

        let shared = Arc::new(Shared {
            m: fresh(),
            value: std::cell::UnsafeCell::new(0),
        });

        let handles: Vec<_> = (1..=4u64)
            .map(|pid| {
                let s = Arc::clone(&shared);
                std::thread::spawn(move || {
                    for _ in 0..10_000 {
                        s.m.lock(pid, 64);
                        unsafe { *s.value.get() += 1 };
                        assert!(s.m.unlock(pid));
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(unsafe { *shared.value.get() }, 40_000);
    }
}
