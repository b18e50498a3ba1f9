//! Heaps: an array of linkages (one per size class, plus the unsized
//! linkage at index 0) and a parent pointer. Thread heaps sit at the
//! bottom; an optional regional heap sits between them and the root. The
//! root (null parent) is the only level that talks to the OS for chunks.

use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering::SeqCst};

use crate::slab::block::Block;
use crate::slab::chunk::{Chunk, ChunkTracker};
use crate::slab::linkage::Linkage;
use crate::slab::{index_to_size, size_to_index, LINKAGE_COUNT};
use crate::{AllocError, Fault};

#[repr(C)]
pub struct Heap {
    pub(crate) parent: AtomicPtr<Heap>,
    pub(crate) owned_heaps: AtomicUsize,
    pub(crate) tracker: *const ChunkTracker,
    pub(crate) lkgs: [Linkage; LINKAGE_COUNT],
}

// Heaps are shared across threads through raw pointers; every mutation of a
// published heap goes through its atomics or a linkage lock.
unsafe impl Send for Heap {}
unsafe impl Sync for Heap {}

impl Heap {
    pub(crate) unsafe fn init_in_place(
        heap: *mut Heap,
        parent: *mut Heap,
        tracker: *const ChunkTracker,
    ) {
        use std::ptr::addr_of_mut;
        addr_of_mut!((*heap).parent).write(AtomicPtr::new(parent));
        addr_of_mut!((*heap).owned_heaps).write(AtomicUsize::new(0));
        addr_of_mut!((*heap).tracker).write(tracker);
        for index in 0..LINKAGE_COUNT {
            Linkage::init_in_place(Self::lkg_ptr(heap, index), index, heap);
        }
        if !parent.is_null() {
            (*parent).owned_heaps.fetch_add(1, SeqCst);
        }
    }

    #[inline(always)]
    pub(crate) unsafe fn lkg_ptr(heap: *mut Heap, index: usize) -> *mut Linkage {
        std::ptr::addr_of_mut!((*heap).lkgs[index])
    }

    /// Serve one `size`-byte object from this heap. Internal faults retry
    /// the fallback tiers; only real resource exhaustion escapes.
    pub(crate) unsafe fn alloc_object(heap: *mut Heap, size: usize) -> Result<*mut u8, AllocError> {
        let index = match size_to_index(size) {
            Some(index) => index,
            None => return Err(AllocError::NoSizeClass),
        };
        loop {
            match Linkage::alloc_object(Self::lkg_ptr(heap, index), heap) {
                Ok(object) => return Ok(object),
                Err(Fault::MapFailed) => return Err(AllocError::OutOfMemory),
                Err(_) => continue,
            }
        }
    }

    /// Entry point for a linkage that needs a replacement block and already
    /// holds its own lock: its own sized list is off the table, so try the
    /// owning heap's unsized linkage, then the chain above.
    ///
    /// Every request tier returns the block locked and excised from
    /// whatever list held it.
    pub(crate) unsafe fn request_block_for(heap: *mut Heap, index: usize) -> Result<*mut Block, Fault> {
        if let Ok(block) = Self::request_from_unsized(Self::lkg_ptr(heap, 0), index_to_size(index)) {
            return Ok(block);
        }
        let parent = (*heap).parent.load(SeqCst);
        if parent.is_null() {
            Self::request_from_top(heap, index)
        } else {
            Self::request_block(parent, index)
        }
    }

    /// Full request chain at `heap` and above: sized list, unsized list,
    /// then the parent; the root maps a fresh chunk.
    unsafe fn request_block(heap: *mut Heap, index: usize) -> Result<*mut Block, Fault> {
        if let Ok(block) = Self::request_from_sized(Self::lkg_ptr(heap, index)) {
            return Ok(block);
        }
        if let Ok(block) = Self::request_from_unsized(Self::lkg_ptr(heap, 0), index_to_size(index)) {
            return Ok(block);
        }
        let parent = (*heap).parent.load(SeqCst);
        if parent.is_null() {
            Self::request_from_top(heap, index)
        } else {
            Self::request_block(parent, index)
        }
    }

    /// Take the first block with free space from a sized pool list,
    /// excising residues encountered on the walk.
    unsafe fn request_from_sized(lkg: *mut Linkage) -> Result<*mut Block, Fault> {
        (*lkg).lock.acquire();
        let mut cursor = (*lkg).active.load(SeqCst);
        if !cursor.is_null() {
            while !(*cursor).prev.is_null() {
                cursor = (*cursor).prev;
            }
        }
        let found = loop {
            if cursor.is_null() {
                break null_mut();
            }
            (*cursor).lock.acquire();
            if (*cursor).pfl.load(SeqCst).is_null() && (*cursor).gfl.load(SeqCst).is_null() {
                let next = (*cursor).next;
                Linkage::excise(lkg, cursor);
                (*cursor).lock.release();
                cursor = next;
            } else {
                break cursor;
            }
        };
        if found.is_null() {
            (*lkg).lock.release();
            return Err(Fault::FreelistEmpty);
        }
        Linkage::excise(lkg, found);
        (*lkg).lock.release();
        Ok(found)
    }

    /// Pop a block from an unsized pool, reformatting it for `osize` if it
    /// last served a different class.
    unsafe fn request_from_unsized(lkg: *mut Linkage, osize: usize) -> Result<*mut Block, Fault> {
        (*lkg).lock.acquire();
        let block = (*lkg).active.load(SeqCst);
        if block.is_null() {
            (*lkg).lock.release();
            return Err(Fault::FreelistEmpty);
        }
        (*block).lock.acquire();
        Linkage::excise(lkg, block);
        (*lkg).lock.release();
        if (*block).osize.load(SeqCst) as usize != osize {
            Block::format_to_size(block, osize);
        }
        Ok(block)
    }

    /// Out of pooled blocks everywhere: map a chunk, keep one block for the
    /// caller, and hand the other 62 to the root's unsized linkage as
    /// applicants.
    unsafe fn request_from_top(root: *mut Heap, index: usize) -> Result<*mut Block, Fault> {
        let chunk = Chunk::alloc()?;
        let block = Chunk::reserve_and_bind(chunk, root, (*root).tracker)?;
        (*block).lock.acquire();
        Block::format_to_size(block, index_to_size(index));
        Ok(block)
    }

    /// Handle a block lifted out of linkage `index` of a child (or of this
    /// heap itself): bounce past the linkage that released it, route
    /// empties to the unsized pool, install where the boundary allows, and
    /// otherwise keep climbing. Past the root, the block is freed back to
    /// its chunk.
    ///
    /// Entered with the block lock held; every terminal consumes it.
    pub(crate) unsafe fn catch_block(
        heap: *mut Heap,
        block: *mut Block,
        index: usize,
        from: *mut Linkage,
    ) {
        let mut level = heap;
        loop {
            if level.is_null() {
                Chunk::release_block(block);
                return;
            }
            let mut recv = Self::lkg_ptr(level, index);
            if recv == from {
                level = (*level).parent.load(SeqCst);
                continue;
            }
            if (*block).acnt.load(SeqCst) == 0 {
                recv = Self::lkg_ptr(level, 0);
            }
            if Linkage::should_receive(level, recv) {
                Linkage::receive_block(recv, block);
                return;
            }
            level = (*level).parent.load(SeqCst);
        }
    }

    /// Hand a fresh chunk-bound block to the root's unsized pool.
    pub(crate) unsafe fn receive_applicant(root: *mut Heap, block: *mut Block) {
        (*block).lock.acquire();
        Linkage::receive_block(Self::lkg_ptr(root, 0), block);
    }

    /// Drain every linkage upward, unsized pool first.
    pub(crate) unsafe fn evacuate(heap: *mut Heap) {
        for index in 0..LINKAGE_COUNT {
            Linkage::evacuate(Self::lkg_ptr(heap, index));
        }
        let parent = (*heap).parent.load(SeqCst);
        if !parent.is_null() {
            (*parent).owned_heaps.fetch_sub(1, SeqCst);
        }
    }

    // Inspection for tests.

    pub unsafe fn linkage(heap: *mut Heap, index: usize) -> *mut Linkage {
        Self::lkg_ptr(heap, index)
    }

    pub unsafe fn owned_heap_count(heap: *mut Heap) -> usize {
        (*heap).owned_heaps.load(SeqCst)
    }
}
