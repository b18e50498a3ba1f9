//! The allocator's universe: root heap, chunk tracker, and regional-heap
//! pool, owned together so tests can run independent instances side by
//! side. The process-wide instance behind [`crate::allocate`] is just one
//! of these behind a `OnceLock`.

use std::mem::MaybeUninit;
use std::ptr::{null_mut, NonNull};

use crate::region::RegionPool;
use crate::slab::block::{self, Block};
use crate::slab::chunk::ChunkTracker;
use crate::slab::heap::Heap;
use crate::slab::linkage::Linkage;
use crate::AllocError;

pub struct AllocatorContext {
    tracker: Box<ChunkTracker>,
    root: Box<Heap>,
    regions: RegionPool,
}

impl AllocatorContext {
    pub fn new() -> AllocatorContext {
        let tracker = Box::new(ChunkTracker::new());
        let mut root: Box<MaybeUninit<Heap>> = Box::new_uninit();
        unsafe { Heap::init_in_place(root.as_mut_ptr(), null_mut(), &*tracker) };
        let root = unsafe { root.assume_init() };
        AllocatorContext {
            tracker,
            root,
            regions: RegionPool::new(),
        }
    }

    pub fn root_heap(&self) -> *mut Heap {
        &*self.root as *const Heap as *mut Heap
    }

    pub(crate) fn tracker_ptr(&self) -> *const ChunkTracker {
        &*self.tracker
    }

    /// Build a child heap parented to `parent` (or to the root when
    /// `parent` is null). The caller drives it from exactly one thread at
    /// a time and evacuates it with [`AllocatorContext::retire_heap`]
    /// before dropping it.
    pub fn new_child_heap(&self, parent: *mut Heap) -> Box<Heap> {
        let parent = if parent.is_null() {
            self.root_heap()
        } else {
            parent
        };
        let mut heap: Box<MaybeUninit<Heap>> = Box::new_uninit();
        unsafe { Heap::init_in_place(heap.as_mut_ptr(), parent, self.tracker_ptr()) };
        unsafe { heap.assume_init() }
    }

    /// Evacuate a child heap's blocks back up the hierarchy.
    pub fn retire_heap(&self, heap: &mut Heap) {
        unsafe { Heap::evacuate(heap as *mut Heap) };
    }

    /// Serve an allocation from `heap`, escalating through this context's
    /// hierarchy.
    pub fn allocate_in(&self, heap: *mut Heap, size: usize) -> Result<NonNull<u8>, AllocError> {
        let object = unsafe { Heap::alloc_object(heap, size) }?;
        Ok(unsafe { NonNull::new_unchecked(object) })
    }

    /// Return `ptr` to its block. Context-free: the block is derived from
    /// the address. Null is a no-op.
    pub fn deallocate(&self, ptr: *mut u8) {
        crate::deallocate(ptr);
    }

    pub fn create_region(&self) -> Result<*mut Heap, AllocError> {
        unsafe { self.regions.create(self.root_heap(), self.tracker_ptr()) }
            .map_err(|_| AllocError::OutOfMemory)
    }

    /// Evacuate the regional heap and recycle its slot. All heaps attached
    /// to the region must have been retired first.
    ///
    /// # Safety
    /// `region` must have come from [`AllocatorContext::create_region`] on
    /// this context and not have been destroyed already.
    pub unsafe fn destroy_region(&self, region: *mut Heap) {
        self.regions.destroy(region);
    }

    /// Re-parent `heap` under `region`. Done before the heap's first
    /// allocation.
    pub fn attach_heap_to_region(&self, region: *mut Heap, heap: *mut Heap) {
        use std::sync::atomic::Ordering::SeqCst;
        unsafe {
            let old = (*heap).parent.swap(region, SeqCst);
            if !old.is_null() {
                (*old).owned_heaps.fetch_sub(1, SeqCst);
            }
            (*region).owned_heaps.fetch_add(1, SeqCst);
        }
    }

    /// Release pooled empty blocks back to the OS by draining the root's
    /// unsized linkage out the top. Blocks still holding live objects (in
    /// sized pools or downstream heaps) are untouched; chunks whose last
    /// block goes are unmapped.
    pub fn trim(&self) {
        unsafe { Linkage::evacuate(Heap::linkage(self.root_heap(), 0)) };
    }

    /// Live chunks in this universe.
    pub fn chunk_count(&self) -> usize {
        self.tracker.chunk_count()
    }

    /// The block serving `ptr`, for invariant checks.
    pub fn block_of(&self, ptr: *mut u8) -> *mut Block {
        block::block_for(ptr)
    }
}

impl Default for AllocatorContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AllocatorContext {
    fn drop(&mut self) {
        // Push every pooled block out the top; past the root they free
        // back to their chunks, and emptied chunks unmap themselves.
        unsafe { Heap::evacuate(self.root_heap()) };
    }
}
