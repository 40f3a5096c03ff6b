//! One-shot initialization flags.

use core::sync::atomic::{AtomicBool, Ordering};

/// A once-only latch. `init_once` returns true exactly once; later calls
/// (and calls racing with the winner) return false.
pub struct InitFlag {
    set: AtomicBool,
}

impl InitFlag {
    pub const fn new() -> Self {
        Self {
            set: AtomicBool::new(false),
        }
    }

    /// Claim initialization. True for the single winning caller.
    #[inline]
    pub fn init_once(&self) -> bool {
        self.set
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Set without claiming (idempotent).
    #[inline]
    pub fn mark_set(&self) {
        self.set.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_set_relaxed(&self) -> bool {
        self.set.load(Ordering::Relaxed)
    }

    /// Reset for reinitialization (tests only).
    #[inline]
    pub fn clear(&self) {
        self.set.store(false, Ordering::Release);
    }
}

impl Default for InitFlag {
    fn default() -> Self {
        Self::new()
    }
}
