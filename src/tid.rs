//! Thread-id service. Every thread that touches the allocator gets a small
//! non-zero 64-bit id, assigned lazily on first use (or eagerly through
//! [`attach`]). A block whose `owning_thread_id` matches the caller takes
//! the lock-free private free-list path on deallocation; everyone else is a
//! foreign thread.

use std::cell::Cell;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::internals::SpinLock;
use crate::fatal;

/// Reserved "no owner" id.
pub const TID_NONE: u64 = 0;

/// Recycle ids of detached threads instead of burning new ones. Off by
/// default: the monotonic space is 64 bits wide and recycling re-runs the
/// risk of a stale `owning_thread_id` matching a new thread.
pub const TID_RECYCLE: bool = false;

static TID_COUNTER: AtomicU64 = AtomicU64::new(TID_NONE);

struct RecycleStack {
    lock: SpinLock,
    ids: UnsafeCell<Vec<u64>>,
}

unsafe impl Sync for RecycleStack {}

static RECYCLED: RecycleStack = RecycleStack {
    lock: SpinLock::new(),
    ids: UnsafeCell::new(Vec::new()),
};

thread_local! {
    static TID: Cell<u64> = const { Cell::new(TID_NONE) };
}

fn next_monotonic() -> u64 {
    let next = TID_COUNTER.fetch_add(1, Ordering::SeqCst) + 1;
    if next == TID_NONE {
        fatal("cannot assign new thread id: monotonic counter overflow");
    }
    next
}

fn next_id() -> u64 {
    if TID_RECYCLE {
        RECYCLED.lock.acquire();
        let recycled = unsafe { (*RECYCLED.ids.get()).pop() };
        RECYCLED.lock.release();
        if let Some(id) = recycled {
            return id;
        }
    }
    next_monotonic()
}

/// The calling thread's id, assigning one if it has none yet.
#[inline]
pub fn current() -> u64 {
    TID.with(|tid| {
        let mut id = tid.get();
        if id == TID_NONE {
            id = next_id();
            tid.set(id);
        }
        id
    })
}

/// Eagerly assign the calling thread an id.
pub fn attach() {
    current();
}

/// Give up the calling thread's id. With [`TID_RECYCLE`] it returns to the
/// pool; otherwise the id is simply retired.
pub fn detach() {
    TID.with(|tid| {
        let id = tid.get();
        if id == TID_NONE {
            return;
        }
        tid.set(TID_NONE);
        if TID_RECYCLE {
            RECYCLED.lock.acquire();
            unsafe { (*RECYCLED.ids.get()).push(id) };
            RECYCLED.lock.release();
        }
    });
}
