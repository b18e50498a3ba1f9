//! stratalloc — a thread-caching, size-segregated slab allocator.
//!
//! Objects are served from 16 KiB blocks of equal-size slots. Each thread
//! owns a heap of per-size-class block lists; blocks migrate between
//! thread heaps, optional regional heaps, and the process root as they
//! fill and drain, and 1 MiB chunks of anonymous memory are mapped and
//! unmapped underneath as the pools grow and shrink.
//!
//! The convenience surface ([`allocate`], [`deallocate`], regions) runs on
//! a process-wide [`AllocatorContext`]; tests and embedders can run
//! independent contexts side by side.
//!
//! Teardown wants quiescence: detaching a thread or destroying a region
//! while other threads still free into its blocks is a race, as it is in
//! any allocator of this shape.

use std::cell::{Cell, UnsafeCell};
use std::fmt;
use std::mem::MaybeUninit;
use std::ptr::{null_mut, NonNull};
use std::sync::OnceLock;

pub mod context;
pub mod internals;
pub mod region;
pub mod slab;
pub mod sys;
pub mod tid;

pub use context::AllocatorContext;
pub use slab::block::block_for;

use slab::block::Block;
use slab::heap::Heap;

pub const PAGE_SIZE: usize = 0x1000;
pub const BLOCK_SIZE: usize = 0x4000;
pub const CHUNK_SIZE: usize = 0x100000;

/// What [`allocate`] can tell the caller: either the request has no size
/// class, or the process is genuinely out of memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    NoSizeClass,
    OutOfMemory,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::NoSizeClass => write!(f, "no size class serves this request"),
            AllocError::OutOfMemory => write!(f, "out of memory"),
        }
    }
}

impl std::error::Error for AllocError {}

/// Internal fault codes. These drive the fallback tiers and never cross
/// the public API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Fail,
    /// Both of a block's free lists are dry.
    BlockEmpty,
    MapFailed,
    UnmapFailed,
    /// A pool linkage had no usable block.
    FreelistEmpty,
    /// A freshly promoted head was already exhausted by the time the
    /// promoting thread allocated from it.
    SpoiledPromotee,
}

/// Unrecoverable misuse or state corruption; mirrors the style of the
/// fatal paths elsewhere in the stack: say what happened, then abort.
pub(crate) fn fatal(what: &str) -> ! {
    eprintln!("[stratalloc FATAL] {what}");
    std::process::abort()
}

static GLOBAL_CTX: OnceLock<AllocatorContext> = OnceLock::new();

fn global() -> &'static AllocatorContext {
    GLOBAL_CTX.get_or_init(AllocatorContext::new)
}

struct ThreadHeapSlot {
    heap: UnsafeCell<MaybeUninit<Heap>>,
    live: Cell<bool>,
    region: Cell<*mut Heap>,
}

impl ThreadHeapSlot {
    const fn new() -> Self {
        ThreadHeapSlot {
            heap: UnsafeCell::new(MaybeUninit::uninit()),
            live: Cell::new(false),
            region: Cell::new(null_mut()),
        }
    }

    fn heap_ptr(&self) -> *mut Heap {
        self.heap.get() as *mut Heap
    }

    fn evacuate(&self) {
        if self.live.get() {
            self.live.set(false);
            unsafe { Heap::evacuate(self.heap_ptr()) };
        }
    }
}

impl Drop for ThreadHeapSlot {
    fn drop(&mut self) {
        self.evacuate();
        tid::detach();
    }
}

thread_local! {
    static THREAD_HEAP: ThreadHeapSlot = const { ThreadHeapSlot::new() };
}

fn with_thread_heap<R>(f: impl FnOnce(*mut Heap) -> R) -> R {
    THREAD_HEAP.with(|slot| {
        let heap = slot.heap_ptr();
        if !slot.live.get() {
            let ctx = global();
            let region = slot.region.get();
            let parent = if region.is_null() {
                ctx.root_heap()
            } else {
                region
            };
            unsafe { Heap::init_in_place(heap, parent, ctx.tracker_ptr()) };
            slot.live.set(true);
        }
        f(heap)
    })
}

/// Allocate `size` bytes from the calling thread's heap, creating the heap
/// on first use.
pub fn allocate(size: usize) -> Result<NonNull<u8>, AllocError> {
    with_thread_heap(|heap| unsafe { Heap::alloc_object(heap, size) })
        .map(|object| unsafe { NonNull::new_unchecked(object) })
}

/// Return `ptr` to the block that issued it. Null is a no-op. Safe to call
/// from any thread; non-owner frees take the block's foreign path.
pub fn deallocate(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    unsafe { Block::dealloc_object(block_for(ptr), ptr) };
}

/// Release the process-wide pool's empty blocks back to the OS.
pub fn trim() {
    global().trim();
}

/// Eagerly assign the calling thread its id. Otherwise ids are assigned
/// lazily on first allocator contact.
pub fn thread_attach() {
    tid::attach();
}

/// Evacuate the calling thread's heap and retire its id. The heap is
/// rebuilt lazily if the thread touches the allocator again.
pub fn thread_detach() {
    THREAD_HEAP.with(|slot| slot.evacuate());
    tid::detach();
}

/// A regional heap on the process-wide context: an aggregation point
/// between a group of thread heaps and the root.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Region {
    heap: *mut Heap,
}

// Region handles are shared freely; the heap behind them is only mutated
// through its linkage locks and atomics.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

pub fn region_create() -> Result<Region, AllocError> {
    global().create_region().map(|heap| Region { heap })
}

/// Evacuate the region and recycle its slot. Threads attached to it must
/// have detached (or never allocated) first.
pub fn region_destroy(region: Region) {
    unsafe { global().destroy_region(region.heap) };
}

/// Parent the calling thread's heap under `region`. Call before the
/// thread's first allocation; a live heap is re-parented in place.
pub fn region_adopt_current_thread(region: Region) {
    THREAD_HEAP.with(|slot| {
        slot.region.set(region.heap);
        if slot.live.get() {
            global().attach_heap_to_region(region.heap, slot.heap_ptr());
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_and_oversize_have_no_class() {
        assert_eq!(allocate(0).unwrap_err(), AllocError::NoSizeClass);
        assert_eq!(
            allocate(slab::MAX_OBJECT_SIZE + 1).unwrap_err(),
            AllocError::NoSizeClass
        );
    }

    #[test]
    fn allocate_round_trips_through_a_block() {
        let ptr = allocate(100).unwrap().as_ptr();
        let block = block_for(ptr);
        unsafe {
            assert_eq!(Block::object_size(block), 128);
            assert!(Block::alive_count(block) >= 1);
        }
        deallocate(ptr);
    }

    #[test]
    fn deallocate_null_is_a_no_op() {
        deallocate(std::ptr::null_mut());
    }
}
