//! Blocks: 16 KiB, address-aligned units of same-size object storage.
//!
//! A block carves its payload into equal slots and threads two singly-linked
//! free lists through the slots' own memory: the private list, popped and
//! pushed by the block's owning thread, and the foreign list, pushed by
//! everyone else under the block lock and drained wholesale by the owner.
//!
//! Deallocation watches two thresholds. The decrement that empties the block
//! runs the empty migration (the linkage may lift the block upstream); the
//! decrement that crosses to exactly half capacity moves the block to the
//! right of its linkage's head, once per drain pass.

use std::ptr::null_mut;
use std::sync::atomic::{
    AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicU8, Ordering::SeqCst,
};

use crate::internals::{align_to, SpinLock};
use crate::slab::linkage::Linkage;
use crate::tid;
use crate::{Fault, BLOCK_SIZE};

/// The block is its linkage's head: the one block serving the owner
/// thread's allocations.
pub const HEAD: u8 = 0x01;
/// The block is installed in a thread linkage (set on head installation,
/// cleared when the block is lifted out).
pub const IN_THEATRE: u8 = 0x02;
/// The block sits right of its linkage's head with significant free space.
pub const RIGHT_OF_HEAD: u8 = 0x04;

#[repr(C)]
pub struct Block {
    /// Private free list. Touched only on the owning thread while the
    /// block is a head, and by migrations hiding it under the block lock.
    pub(crate) pfl: AtomicPtr<u8>,
    /// Foreign free list. Pushed under the block lock, drained by the owner
    /// with a single exchange.
    pub(crate) gfl: AtomicPtr<u8>,
    pub(crate) flags: AtomicU8,
    /// Single-slot token claiming the half-empty migration.
    pub(crate) righting: AtomicBool,
    pub(crate) osize: AtomicU32,
    pub(crate) ocnt: AtomicU32,
    pub(crate) acnt: AtomicU32,
    /// Linkage list links; only touched under the owning linkage's lock.
    pub(crate) prev: *mut Block,
    pub(crate) next: *mut Block,
    pub(crate) owning_lkg: AtomicPtr<Linkage>,
    pub(crate) owning_tid: AtomicU64,
    pub(crate) lock: SpinLock,
}

/// Header bytes reserved at the block base; the payload starts here.
pub const BLOCK_HEADER_SIZE: usize = align_to(size_of::<Block>(), 16);
pub const BLOCK_PAYLOAD_SIZE: usize = BLOCK_SIZE - BLOCK_HEADER_SIZE;

/// The block serving the object at `object`. Blocks are block-size aligned,
/// so this is a mask.
#[inline(always)]
pub fn block_for(object: *mut u8) -> *mut Block {
    (object as usize & !(BLOCK_SIZE - 1)) as *mut Block
}

impl Block {
    /// Zero the header. The zeroed state is fully formed: empty free lists,
    /// no flags, no owner, unlocked lock, unsized.
    pub(crate) unsafe fn init(block: *mut Block) {
        std::ptr::write_bytes(block as *mut u8, 0, BLOCK_HEADER_SIZE);
    }

    #[inline(always)]
    pub(crate) fn payload(block: *mut Block) -> *mut u8 {
        unsafe { (block as *mut u8).add(BLOCK_HEADER_SIZE) }
    }

    /// Rewrite the block for `osize`-byte objects: thread the private free
    /// list through the payload (slot i points at slot i+1), reset the
    /// counters and flags. Caller holds the block lock and the block is in
    /// no list.
    pub(crate) unsafe fn format_to_size(block: *mut Block, osize: usize) {
        let memory = Self::payload(block);
        let count = BLOCK_PAYLOAD_SIZE / osize;
        let mut i = 0;
        while i + 1 < count {
            *(memory.add(i * osize) as *mut *mut u8) = memory.add((i + 1) * osize);
            i += 1;
        }
        *(memory.add(i * osize) as *mut *mut u8) = null_mut();

        (*block).pfl.store(memory, SeqCst);
        (*block).gfl.store(null_mut(), SeqCst);
        (*block).osize.store(osize as u32, SeqCst);
        (*block).ocnt.store(count as u32, SeqCst);
        (*block).acnt.store(0, SeqCst);
        (*block).flags.store(0, SeqCst);
        (*block).righting.store(false, SeqCst);
    }

    #[inline(always)]
    unsafe fn pop_private(block: *mut Block) -> *mut u8 {
        let object = (*block).pfl.load(SeqCst);
        let next = *(object as *mut *mut u8);
        (*block).pfl.store(next, SeqCst);
        (*block).acnt.fetch_add(1, SeqCst);
        object
    }

    /// Owner-thread allocation. Lock-free while the private list holds
    /// slots; otherwise drains the foreign list into it under the block
    /// lock. `BlockEmpty` means both lists are dry.
    ///
    /// The private list is re-checked under the lock: a migration restore
    /// may have refilled the foreign list since the fast-path check.
    pub(crate) unsafe fn alloc_object(block: *mut Block) -> Result<*mut u8, Fault> {
        if !(*block).pfl.load(SeqCst).is_null() {
            return Ok(Self::pop_private(block));
        }
        (*block).lock.acquire();
        if (*block).pfl.load(SeqCst).is_null() {
            let drained = (*block).gfl.swap(null_mut(), SeqCst);
            (*block).pfl.store(drained, SeqCst);
        }
        (*block).lock.release();
        if (*block).pfl.load(SeqCst).is_null() {
            return Err(Fault::BlockEmpty);
        }
        Ok(Self::pop_private(block))
    }

    /// Return `object` to the block and run the threshold protocol.
    ///
    /// The owner tid is set only while the block is a head, and heads only
    /// change state on their owner's thread, so the lock-free private push
    /// never overlaps a hide, a restore, or another push.
    pub(crate) unsafe fn dealloc_object(block: *mut Block, object: *mut u8) {
        if tid::current() == (*block).owning_tid.load(SeqCst) {
            *(object as *mut *mut u8) = (*block).pfl.load(SeqCst);
            (*block).pfl.store(object, SeqCst);
        } else {
            (*block).lock.acquire();
            *(object as *mut *mut u8) = (*block).gfl.load(SeqCst);
            (*block).gfl.store(object, SeqCst);
            (*block).lock.release();
        }

        let remaining = (*block).acnt.fetch_sub(1, SeqCst) - 1;
        if remaining == 0 {
            Self::on_drained(block);
        } else if remaining == (*block).ocnt.load(SeqCst) / 2 {
            Self::on_half_drained(block);
        }
    }

    /// Detach both free lists so concurrent linkage walks see the block as
    /// an in-flight residue and excise rather than promote it.
    pub(crate) unsafe fn hide_free_lists(block: *mut Block) -> (*mut u8, *mut u8) {
        (
            (*block).pfl.swap(null_mut(), SeqCst),
            (*block).gfl.swap(null_mut(), SeqCst),
        )
    }

    /// Re-attach hidden lists, merging with anything freed into the block
    /// while they were hidden. Both chains land on the foreign list, whose
    /// every access is under the block lock (held by the caller); the
    /// owner refills from it on demand. Writing the private list here
    /// would race its lock-free pops.
    pub(crate) unsafe fn restore_free_lists(block: *mut Block, pfl: *mut u8, gfl: *mut u8) {
        for chain in [pfl, gfl] {
            if chain.is_null() {
                continue;
            }
            let tail = Self::list_tail(chain);
            *(tail as *mut *mut u8) = (*block).gfl.load(SeqCst);
            (*block).gfl.store(chain, SeqCst);
        }
    }

    unsafe fn list_tail(mut slot: *mut u8) -> *mut u8 {
        loop {
            let next = *(slot as *mut *mut u8);
            if next.is_null() {
                return slot;
            }
            slot = next;
        }
    }

    /// Lock the block's owning linkage, re-reading the affiliation after
    /// each acquisition: it may change while the block lock is not held.
    pub(crate) unsafe fn lock_owning_linkage(block: *mut Block) -> *mut Linkage {
        loop {
            let lkg = (*block).owning_lkg.load(SeqCst);
            (*lkg).lock.acquire();
            if lkg == (*block).owning_lkg.load(SeqCst) {
                return lkg;
            }
            (*lkg).lock.release();
        }
    }

    /// The decrement that produced zero. Heads stay where they are; for
    /// anything else, hide the lists, take the linkage lock, and let the
    /// linkage decide whether to lift.
    unsafe fn on_drained(block: *mut Block) {
        (*block).lock.acquire();
        if (*block).flags.load(SeqCst) & HEAD != 0
            || (*block).acnt.load(SeqCst) != 0
            || (*block).righting.load(SeqCst)
        {
            // head, refilled, or a half-empty migration is mid-flight
            (*block).lock.release();
            return;
        }
        let (pfl, gfl) = Self::hide_free_lists(block);
        (*block).lock.release();

        let lkg = Self::lock_owning_linkage(block);
        (*block).lock.acquire();
        Self::restore_free_lists(block, pfl, gfl);
        if (*block).flags.load(SeqCst) & HEAD != 0 || (*block).acnt.load(SeqCst) != 0 {
            // promoted or refilled while we waited for the linkage
            (*block).lock.release();
            (*lkg).lock.release();
            return;
        }
        Linkage::block_did_become_empty(lkg, block);
    }

    /// The decrement that crossed to exactly half capacity. Claim the
    /// righting token, revalidate, and move the block right of head.
    unsafe fn on_half_drained(block: *mut Block) {
        if (*block).flags.load(SeqCst) & RIGHT_OF_HEAD != 0 {
            return;
        }
        (*block).lock.acquire();
        let flags = (*block).flags.load(SeqCst);
        if flags & (HEAD | RIGHT_OF_HEAD) != 0 || flags & IN_THEATRE == 0 {
            (*block).lock.release();
            return;
        }
        if (*block).righting.swap(true, SeqCst) {
            (*block).lock.release();
            return;
        }
        let alive = (*block).acnt.load(SeqCst);
        if alive == 0 || alive > (*block).ocnt.load(SeqCst) / 2 {
            (*block).righting.store(false, SeqCst);
            (*block).lock.release();
            return;
        }
        let (pfl, gfl) = Self::hide_free_lists(block);
        (*block).lock.release();

        let lkg = Self::lock_owning_linkage(block);
        (*block).lock.acquire();
        Self::restore_free_lists(block, pfl, gfl);
        let flags = (*block).flags.load(SeqCst);
        if flags & HEAD != 0 || flags & IN_THEATRE == 0 || (*block).acnt.load(SeqCst) == 0 {
            // promoted, lifted by an evacuation, or drained dry while we
            // waited; the shift no longer applies
            (*block).righting.store(false, SeqCst);
            (*block).lock.release();
            (*lkg).lock.release();
            return;
        }
        Linkage::block_did_become_partially_empty(lkg, block);
    }

    // Inspection, mainly for tests and diagnostics.

    pub unsafe fn alive_count(block: *mut Block) -> usize {
        (*block).acnt.load(SeqCst) as usize
    }

    pub unsafe fn object_size(block: *mut Block) -> usize {
        (*block).osize.load(SeqCst) as usize
    }

    pub unsafe fn object_capacity(block: *mut Block) -> usize {
        (*block).ocnt.load(SeqCst) as usize
    }

    pub unsafe fn owning_thread_id(block: *mut Block) -> u64 {
        (*block).owning_tid.load(SeqCst)
    }

    /// Total length of both free lists. Takes the block lock; meaningful
    /// only while no other thread is allocating from the block.
    pub unsafe fn free_slot_count(block: *mut Block) -> usize {
        unsafe fn list_len(mut slot: *mut u8) -> usize {
            let mut n = 0;
            while !slot.is_null() {
                n += 1;
                slot = *(slot as *mut *mut u8);
            }
            n
        }
        (*block).lock.acquire();
        let n = list_len((*block).pfl.load(SeqCst)) + list_len((*block).gfl.load(SeqCst));
        (*block).lock.release();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys;

    unsafe fn scratch_block() -> *mut Block {
        let base = sys::map_pages_aligned(BLOCK_SIZE, BLOCK_SIZE).unwrap();
        let block = base as *mut Block;
        Block::init(block);
        block
    }

    #[test]
    fn header_leaves_an_aligned_payload() {
        assert_eq!(BLOCK_HEADER_SIZE % 16, 0);
        assert!(BLOCK_HEADER_SIZE >= size_of::<Block>());
        assert!(BLOCK_PAYLOAD_SIZE > BLOCK_SIZE / 2);
    }

    #[test]
    fn format_builds_a_full_free_list() {
        unsafe {
            let block = scratch_block();
            Block::format_to_size(block, 128);
            assert_eq!(Block::object_size(block), 128);
            assert_eq!(Block::object_capacity(block), BLOCK_PAYLOAD_SIZE / 128);
            assert_eq!(Block::alive_count(block), 0);
            assert_eq!(Block::free_slot_count(block), Block::object_capacity(block));
            sys::unmap_pages(block as *mut u8, BLOCK_SIZE);
        }
    }

    #[test]
    fn alloc_drains_then_reports_empty() {
        unsafe {
            let block = scratch_block();
            Block::format_to_size(block, 512);
            let capacity = Block::object_capacity(block);
            let mut seen = Vec::new();
            for _ in 0..capacity {
                let object = Block::alloc_object(block).unwrap();
                assert_eq!(block_for(object), block);
                seen.push(object as usize);
            }
            seen.sort_unstable();
            seen.dedup();
            assert_eq!(seen.len(), capacity);
            assert!(matches!(Block::alloc_object(block), Err(Fault::BlockEmpty)));
            assert_eq!(Block::alive_count(block), capacity);
            sys::unmap_pages(block as *mut u8, BLOCK_SIZE);
        }
    }

    #[test]
    fn foreign_frees_refill_the_owner() {
        unsafe {
            let block = scratch_block();
            Block::format_to_size(block, 256);
            // Claim head ownership so our own frees stay private, then
            // route one free through the foreign path by faking the owner.
            (*block).flags.store(HEAD, std::sync::atomic::Ordering::SeqCst);
            (*block)
                .owning_tid
                .store(crate::tid::current(), std::sync::atomic::Ordering::SeqCst);

            let a = Block::alloc_object(block).unwrap();
            let b = Block::alloc_object(block).unwrap();
            Block::dealloc_object(block, a);
            (*block)
                .owning_tid
                .store(u64::MAX, std::sync::atomic::Ordering::SeqCst);
            Block::dealloc_object(block, b);
            assert_eq!(Block::alive_count(block), 0);
            assert_eq!(Block::free_slot_count(block), Block::object_capacity(block));
            sys::unmap_pages(block as *mut u8, BLOCK_SIZE);
        }
    }

    #[test]
    fn restore_merges_with_interleaved_frees() {
        unsafe {
            let block = scratch_block();
            Block::format_to_size(block, 1024);
            (*block).flags.store(HEAD, std::sync::atomic::Ordering::SeqCst);
            (*block)
                .owning_tid
                .store(crate::tid::current(), std::sync::atomic::Ordering::SeqCst);
            let capacity = Block::object_capacity(block);
            let objects: Vec<_> = (0..capacity)
                .map(|_| Block::alloc_object(block).unwrap())
                .collect();

            let (pfl, gfl) = Block::hide_free_lists(block);
            assert!(pfl.is_null() && gfl.is_null());
            // Frees landing while the lists are hidden...
            Block::dealloc_object(block, objects[0]);
            (*block)
                .owning_tid
                .store(u64::MAX, std::sync::atomic::Ordering::SeqCst);
            Block::dealloc_object(block, objects[1]);
            let (pfl, gfl) = Block::hide_free_lists(block);
            (*block).lock.acquire();
            Block::restore_free_lists(block, pfl, gfl);
            (*block).lock.release();
            // ...survive the restore.
            assert_eq!(Block::free_slot_count(block), 2);
            sys::unmap_pages(block as *mut u8, BLOCK_SIZE);
        }
    }
}
