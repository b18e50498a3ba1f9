use std::{
    hint::spin_loop,
    sync::atomic::{AtomicBool, Ordering},
};

/// Raw in-place mutex used for block headers, linkages, the chunk tracker and
/// the regional-heap freelist.
///
/// The zeroed state is the unlocked state, so a lock living inside a
/// freshly mapped (zero-filled) block header is ready to use without an
/// init step, and there is nothing to destroy when the pages are unmapped.
///
/// Lock order: linkage, then block, then chunk tracker, then regional
/// freelist. Multiple block locks are held only while walking a linkage's
/// `next` chain, left to right.
#[repr(transparent)]
pub struct SpinLock {
    state: AtomicBool,
}

impl SpinLock {
    pub const fn new() -> Self {
        SpinLock {
            state: AtomicBool::new(false),
        }
    }

    #[inline(always)]
    pub fn acquire(&self) {
        while self
            .state
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.state.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
    }

    #[inline(always)]
    pub fn try_acquire(&self) -> bool {
        self.state
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline(always)]
    pub fn release(&self) {
        self.state.store(false, Ordering::Release);
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}
