//! Chunks: 1 MiB, self-aligned slabs of anonymous memory. The first 16 KiB
//! holds the chunk header; the remaining 63 block-sized slots hold blocks.
//! A bitmask records which blocks are still live; when the last one goes,
//! the chunk unmaps itself. Live chunks hang off the process-wide tracker.

use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering::SeqCst};

use crate::internals::SpinLock;
use crate::slab::block::Block;
use crate::slab::heap::Heap;
use crate::sys;
use crate::{Fault, BLOCK_SIZE, CHUNK_SIZE};

/// Usable blocks per chunk; slot 0 is the header.
pub const BLOCKS_PER_CHUNK: usize = CHUNK_SIZE / BLOCK_SIZE - 1;

#[repr(C)]
pub struct Chunk {
    pub(crate) prev: *mut Chunk,
    pub(crate) next: *mut Chunk,
    pub(crate) tracker: *const ChunkTracker,
    pub(crate) nactive: AtomicUsize,
    /// Bit N-1 set ⇔ block N live, blocks numbered 1..=63.
    pub(crate) active_mask: AtomicU64,
}

pub struct ChunkTracker {
    first: AtomicPtr<Chunk>,
    lock: SpinLock,
}

impl ChunkTracker {
    pub const fn new() -> Self {
        ChunkTracker {
            first: AtomicPtr::new(null_mut()),
            lock: SpinLock::new(),
        }
    }

    /// Number of live chunks. Walks the list under the tracker lock.
    pub fn chunk_count(&self) -> usize {
        self.lock.acquire();
        let mut n = 0;
        let mut chunk = self.first.load(SeqCst);
        while !chunk.is_null() {
            n += 1;
            chunk = unsafe { (*chunk).next };
        }
        self.lock.release();
        n
    }
}

impl Default for ChunkTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// The chunk holding `block`. Chunks are chunk-size aligned.
#[inline(always)]
pub fn chunk_for(block: *mut Block) -> *mut Chunk {
    (block as usize & !(CHUNK_SIZE - 1)) as *mut Chunk
}

/// `block`'s slot number within its chunk, 1..=63.
#[inline(always)]
pub fn block_number(block: *mut Block) -> usize {
    (block as usize & (CHUNK_SIZE - 1)) / BLOCK_SIZE
}

impl Chunk {
    /// Map a fresh self-aligned chunk. The mapping arrives zeroed, which is
    /// the header's ground state.
    pub unsafe fn alloc() -> Result<*mut Chunk, Fault> {
        let base = sys::map_pages_aligned(CHUNK_SIZE, CHUNK_SIZE)?;
        let chunk = base as *mut Chunk;
        (*chunk).prev = null_mut();
        (*chunk).next = null_mut();
        (*chunk).tracker = std::ptr::null();
        (*chunk).nactive = AtomicUsize::new(0);
        (*chunk).active_mask = AtomicU64::new(0);
        Ok(chunk)
    }

    unsafe fn bind_impl(chunk: *mut Chunk, tracker: *const ChunkTracker) {
        (*chunk).tracker = tracker;
        (*tracker).lock.acquire();
        (*chunk).prev = null_mut();
        (*chunk).next = (*tracker).first.load(SeqCst);
        if !(*chunk).next.is_null() {
            (*(*chunk).next).prev = chunk;
        }
        (*tracker).first.store(chunk, SeqCst);
        (*tracker).lock.release();

        let mut mask = 0u64;
        for number in 1..=BLOCKS_PER_CHUNK {
            let block = (chunk as *mut u8).add(number * BLOCK_SIZE) as *mut Block;
            Block::init(block);
            mask |= 1 << (number - 1);
        }
        (*chunk).active_mask.store(mask, SeqCst);
        (*chunk).nactive.store(BLOCKS_PER_CHUNK, SeqCst);
    }

    /// Put the chunk on the tracker and hand every block to the root's
    /// unsized pool as an applicant.
    pub unsafe fn bind(chunk: *mut Chunk, root: *mut Heap, tracker: *const ChunkTracker) {
        Self::bind_impl(chunk, tracker);
        for number in 1..=BLOCKS_PER_CHUNK {
            let block = (chunk as *mut u8).add(number * BLOCK_SIZE) as *mut Block;
            Heap::receive_applicant(root, block);
        }
    }

    /// Like [`Chunk::bind`], but withhold the first block and return it to
    /// the caller, so the bind is guaranteed to yield a usable block even
    /// if the distributed applicants are snapped up concurrently.
    pub(crate) unsafe fn reserve_and_bind(
        chunk: *mut Chunk,
        root: *mut Heap,
        tracker: *const ChunkTracker,
    ) -> Result<*mut Block, Fault> {
        Self::bind_impl(chunk, tracker);
        let mut reserved: *mut Block = null_mut();
        for number in 1..=BLOCKS_PER_CHUNK {
            let block = (chunk as *mut u8).add(number * BLOCK_SIZE) as *mut Block;
            if reserved.is_null() {
                reserved = block;
            } else {
                Heap::receive_applicant(root, block);
            }
        }
        if reserved.is_null() {
            return Err(Fault::Fail);
        }
        Ok(reserved)
    }

    /// Free one block back to the OS, outside any linkage. Consumes the
    /// block lock. Freeing the last block frees the chunk.
    pub(crate) unsafe fn release_block(block: *mut Block) {
        let chunk = chunk_for(block);
        let number = block_number(block);
        (*chunk).active_mask.fetch_and(!(1u64 << (number - 1)), SeqCst);
        let remaining = (*chunk).nactive.fetch_sub(1, SeqCst) - 1;
        (*block).lock.release();
        sys::unmap_pages(block as *mut u8, BLOCK_SIZE);
        if remaining == 0 {
            Self::free(chunk);
        }
    }

    /// Unmap every still-active block in runs of contiguous mask bits,
    /// unlink from the tracker, and unmap the header. No block of the
    /// chunk may be referenced by any linkage at this point.
    pub(crate) unsafe fn free(chunk: *mut Chunk) {
        let mask = (*chunk).active_mask.swap(0, SeqCst);
        let mut bit = 0;
        while bit < BLOCKS_PER_CHUNK {
            if mask & (1 << bit) == 0 {
                bit += 1;
                continue;
            }
            let start = bit;
            while bit < BLOCKS_PER_CHUNK && mask & (1 << bit) != 0 {
                bit += 1;
            }
            let run = (chunk as *mut u8).add((start + 1) * BLOCK_SIZE);
            sys::unmap_pages(run, (bit - start) * BLOCK_SIZE);
        }

        let tracker = (*chunk).tracker;
        (*tracker).lock.acquire();
        if (*tracker).first.load(SeqCst) == chunk {
            (*tracker).first.store((*chunk).next, SeqCst);
            if !(*chunk).next.is_null() {
                (*(*chunk).next).prev = null_mut();
            }
        } else {
            (*(*chunk).prev).next = (*chunk).next;
            if !(*chunk).next.is_null() {
                (*(*chunk).next).prev = (*chunk).prev;
            }
        }
        (*tracker).lock.release();

        sys::unmap_pages(chunk as *mut u8, BLOCK_SIZE);
    }

    // Inspection for tests.

    pub unsafe fn active_block_count(chunk: *mut Chunk) -> usize {
        (*chunk).nactive.load(SeqCst)
    }

    pub unsafe fn active_block_mask(chunk: *mut Chunk) -> u64 {
        (*chunk).active_mask.load(SeqCst)
    }
}
