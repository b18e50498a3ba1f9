//! Linkages: the per-size-class, doubly-linked block lists inside a heap.
//!
//! In a sized linkage the `active` block is the head serving the owner
//! thread. Blocks left of head (the `prev` direction) hold no significant
//! free space; blocks right of head carry `RIGHT_OF_HEAD` and got there by
//! draining to half capacity or by a downstream evacuation. The unsized
//! linkage (index 0) pools empty blocks of any class awaiting reuse.
//!
//! A block found with both free lists null during a list walk is a residue:
//! a migration in flight hid its lists before waiting on the linkage lock.
//! Walks excise residues and move on; the migrator reclaims the block when
//! it gets the lock.

use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering::SeqCst};

use crate::internals::SpinLock;
use crate::slab::block::{Block, HEAD, IN_THEATRE, RIGHT_OF_HEAD};
use crate::slab::heap::Heap;
use crate::tid;
use crate::tid::TID_NONE;
use crate::Fault;

/// How many blocks a linkage will pool before refusing incoming blocks and
/// lifting empties upstream.
pub const LIFT_BOUNDARY_ROOT_UNSIZED: usize = 64;
pub const LIFT_BOUNDARY_ROOT_SIZED: usize = 32;
pub const LIFT_BOUNDARY_UNSIZED: usize = 24;
pub const LIFT_BOUNDARY_SIZED: usize = 16;

#[repr(C)]
pub struct Linkage {
    /// List anchor; the head block in a live thread linkage, otherwise the
    /// insertion point for received blocks.
    pub(crate) active: AtomicPtr<Block>,
    pub(crate) owning_heap: AtomicPtr<Heap>,
    pub(crate) index: usize,
    pub(crate) nblocks: AtomicUsize,
    pub(crate) lock: SpinLock,
}

impl Linkage {
    pub(crate) unsafe fn init_in_place(lkg: *mut Linkage, index: usize, heap: *mut Heap) {
        use std::ptr::addr_of_mut;
        addr_of_mut!((*lkg).active).write(AtomicPtr::new(null_mut()));
        addr_of_mut!((*lkg).owning_heap).write(AtomicPtr::new(heap));
        addr_of_mut!((*lkg).index).write(index);
        addr_of_mut!((*lkg).nblocks).write(AtomicUsize::new(0));
        addr_of_mut!((*lkg).lock).write(SpinLock::new());
    }

    fn boundary(root: bool, index: usize) -> usize {
        match (root, index) {
            (true, 0) => LIFT_BOUNDARY_ROOT_UNSIZED,
            (true, _) => LIFT_BOUNDARY_ROOT_SIZED,
            (false, 0) => LIFT_BOUNDARY_UNSIZED,
            (false, _) => LIFT_BOUNDARY_SIZED,
        }
    }

    /// Whether `lkg` (owned by `heap`) takes another block.
    pub(crate) unsafe fn should_receive(heap: *mut Heap, lkg: *mut Linkage) -> bool {
        let root = (*heap).parent.load(SeqCst).is_null();
        (*lkg).nblocks.load(SeqCst) < Self::boundary(root, (*lkg).index)
    }

    /// Whether an empty block should leave `lkg` for upstream.
    unsafe fn should_lift(lkg: *mut Linkage) -> bool {
        let heap = (*lkg).owning_heap.load(SeqCst);
        let root = (*heap).parent.load(SeqCst).is_null();
        (*lkg).nblocks.load(SeqCst) >= Self::boundary(root, (*lkg).index)
    }

    /// Whether `block` is currently linked into `lkg`. An excised block has
    /// cauterized links and is not the anchor. Caller holds the linkage
    /// lock.
    pub(crate) unsafe fn holds(lkg: *mut Linkage, block: *mut Block) -> bool {
        (*lkg).active.load(SeqCst) == block
            || !(*block).prev.is_null()
            || !(*block).next.is_null()
    }

    /// Unlink `block`, re-anchoring `active` to a neighbor if it was the
    /// anchor, and cauterize its links. Caller holds the linkage lock.
    pub(crate) unsafe fn excise(lkg: *mut Linkage, block: *mut Block) {
        if (*lkg).active.load(SeqCst) == block {
            let replacement = if !(*block).next.is_null() {
                (*block).next
            } else {
                (*block).prev
            };
            (*lkg).active.store(replacement, SeqCst);
        }
        if !(*block).prev.is_null() {
            (*(*block).prev).next = (*block).next;
        }
        if !(*block).next.is_null() {
            (*(*block).next).prev = (*block).prev;
        }
        (*block).prev = null_mut();
        (*block).next = null_mut();
        (*lkg).nblocks.fetch_sub(1, SeqCst);
    }

    /// Serve one object from this linkage, pulling or sliding a new head in
    /// as needed. Called only by the thread that owns the enclosing heap.
    pub(crate) unsafe fn alloc_object(lkg: *mut Linkage, heap: *mut Heap) -> Result<*mut u8, Fault> {
        loop {
            let head = (*lkg).active.load(SeqCst);
            if head.is_null() {
                return Self::install_pulled_head(lkg, heap);
            }
            if (*head).flags.load(SeqCst) & HEAD == 0 {
                // an applicant landed at the anchor; make it the head
                Self::promote_anchor(lkg);
                continue;
            }
            match Block::alloc_object(head) {
                Ok(object) => return Ok(object),
                Err(_) => return Self::replace_head(lkg, heap, head),
            }
        }
    }

    /// HEAD and the owner tid only ever change under the block lock, so
    /// the migration triggers can trust the flags they read there.
    unsafe fn promote_anchor(lkg: *mut Linkage) {
        (*lkg).lock.acquire();
        let anchor = (*lkg).active.load(SeqCst);
        if !anchor.is_null() && (*anchor).flags.load(SeqCst) & HEAD == 0 {
            (*anchor).lock.acquire();
            Self::install_head(lkg, anchor);
            (*anchor).lock.release();
        }
        (*lkg).lock.release();
    }

    /// Empty linkage: pull a block from the heap chain and install it as
    /// the sole head.
    unsafe fn install_pulled_head(lkg: *mut Linkage, heap: *mut Heap) -> Result<*mut u8, Fault> {
        (*lkg).lock.acquire();
        if !(*lkg).active.load(SeqCst).is_null() {
            // a receive beat us to the anchor
            (*lkg).lock.release();
            return Err(Fault::BlockEmpty);
        }
        let block = match Heap::request_block_for(heap, (*lkg).index) {
            Ok(block) => block,
            Err(fault) => {
                (*lkg).lock.release();
                return Err(fault);
            }
        };
        Self::install_head(lkg, block);
        (*block).prev = null_mut();
        (*block).next = null_mut();
        (*lkg).active.store(block, SeqCst);
        (*lkg).nblocks.fetch_add(1, SeqCst);
        (*block).lock.release();
        (*lkg).lock.release();

        Block::alloc_object(block).map_err(|_| Fault::SpoiledPromotee)
    }

    /// Stamp head state onto a block arriving under its lock.
    unsafe fn install_head(lkg: *mut Linkage, block: *mut Block) {
        (*block).flags.fetch_or(HEAD | IN_THEATRE, SeqCst);
        (*block).flags.fetch_and(!RIGHT_OF_HEAD, SeqCst);
        (*block).owning_tid.store(tid::current(), SeqCst);
        (*block).owning_lkg.store(lkg, SeqCst);
    }

    /// Shift a spent head out of the serving position. Clearing the owner
    /// tid routes the owner's further frees through the foreign list:
    /// lock-free private pushes are a head-only privilege. Caller holds
    /// the block lock.
    unsafe fn demote_head(block: *mut Block) {
        (*block).flags.fetch_and(!HEAD, SeqCst);
        (*block).owning_tid.store(TID_NONE, SeqCst);
    }

    /// The head ran dry. Slide to the first live right neighbor, excising
    /// residues on the way; failing that, pull a block from the heap and
    /// install it as the new head, shifting the old head left.
    unsafe fn replace_head(
        lkg: *mut Linkage,
        heap: *mut Heap,
        head: *mut Block,
    ) -> Result<*mut u8, Fault> {
        (*lkg).lock.acquire();
        if (*lkg).active.load(SeqCst) != head {
            (*lkg).lock.release();
            return Err(Fault::BlockEmpty);
        }
        (*head).lock.acquire();

        // slide
        let slid = loop {
            let candidate = (*head).next;
            if candidate.is_null() {
                break null_mut();
            }
            (*candidate).lock.acquire();
            if (*candidate).pfl.load(SeqCst).is_null() && (*candidate).gfl.load(SeqCst).is_null() {
                Self::excise(lkg, candidate);
                (*candidate).lock.release();
            } else {
                break candidate;
            }
        };
        if !slid.is_null() {
            Self::demote_head(head);
            Self::install_head(lkg, slid);
            (*lkg).active.store(slid, SeqCst);
            (*slid).lock.release();
            (*head).lock.release();
            (*lkg).lock.release();
            return Block::alloc_object(slid).map_err(|_| Fault::SpoiledPromotee);
        }

        // pull
        let pulled = match Heap::request_block_for(heap, (*lkg).index) {
            Ok(block) => block,
            Err(fault) => {
                (*head).lock.release();
                (*lkg).lock.release();
                return Err(fault);
            }
        };
        Self::install_head(lkg, pulled);
        Self::demote_head(head);
        (*pulled).prev = head;
        (*pulled).next = (*head).next;
        if !(*pulled).next.is_null() {
            (*(*pulled).next).prev = pulled;
        }
        (*head).next = pulled;
        (*lkg).active.store(pulled, SeqCst);
        (*lkg).nblocks.fetch_add(1, SeqCst);
        (*pulled).lock.release();
        (*head).lock.release();
        (*lkg).lock.release();

        Block::alloc_object(pulled).map_err(|_| Fault::SpoiledPromotee)
    }

    /// A non-head block drained to zero. Below the lift boundary it stays
    /// as local inventory; at or above it, it leaves for the parent heap.
    /// A block already excised as a residue always leaves: nothing else
    /// references it.
    ///
    /// Entered with the linkage and block locks held; consumes both.
    pub(crate) unsafe fn block_did_become_empty(lkg: *mut Linkage, block: *mut Block) {
        let linked = Self::holds(lkg, block);
        if linked && !Self::should_lift(lkg) {
            (*block).lock.release();
            (*lkg).lock.release();
            return;
        }
        if linked {
            Self::excise(lkg, block);
        }
        (*block).flags.fetch_and(!(IN_THEATRE | RIGHT_OF_HEAD), SeqCst);
        (*block).owning_tid.store(TID_NONE, SeqCst);
        let heap = (*lkg).owning_heap.load(SeqCst);
        let index = (*lkg).index;
        (*lkg).lock.release();
        Heap::catch_block(heap, block, index, lkg);
    }

    /// A left-of-head block crossed the half-empty threshold: move it to
    /// the immediate right of the head and flag it. Never escalates to the
    /// heap. Entered with the linkage and block locks held; consumes both
    /// and releases the righting token.
    pub(crate) unsafe fn block_did_become_partially_empty(lkg: *mut Linkage, block: *mut Block) {
        if Self::holds(lkg, block) {
            Self::excise(lkg, block);
        }
        let head = (*lkg).active.load(SeqCst);
        if head.is_null() {
            // every other block left while the shift was in flight;
            // re-anchor here
            (*lkg).active.store(block, SeqCst);
        } else {
            (*block).prev = head;
            (*block).next = (*head).next;
            if !(*block).next.is_null() {
                (*(*block).next).prev = block;
            }
            (*head).next = block;
            (*block).flags.fetch_or(RIGHT_OF_HEAD, SeqCst);
        }
        (*lkg).nblocks.fetch_add(1, SeqCst);
        (*block).righting.store(false, SeqCst);
        (*block).lock.release();
        (*lkg).lock.release();
    }

    /// Receive a block lifted from elsewhere (or a fresh applicant):
    /// insert it immediately left of the anchor, or anchor the list on it.
    /// HEAD stays clear; the next allocate promotes it if it ends up
    /// serving. Entered with the block lock held; consumes it.
    ///
    /// Takes the linkage lock while holding the block lock; safe against
    /// the declared order because the incoming block is linked into no
    /// list, so no linkage-first walk can be holding or waiting on it.
    pub(crate) unsafe fn receive_block(lkg: *mut Linkage, block: *mut Block) {
        (*lkg).lock.acquire();
        let anchor = (*lkg).active.load(SeqCst);
        if anchor.is_null() {
            (*block).prev = null_mut();
            (*block).next = null_mut();
            (*lkg).active.store(block, SeqCst);
        } else {
            (*block).prev = (*anchor).prev;
            (*block).next = anchor;
            if !(*block).prev.is_null() {
                (*(*block).prev).next = block;
            }
            (*anchor).prev = block;
        }
        (*block).flags.fetch_and(!(HEAD | RIGHT_OF_HEAD), SeqCst);
        (*block).owning_lkg.store(lkg, SeqCst);
        (*block).owning_tid.store(TID_NONE, SeqCst);
        (*lkg).nblocks.fetch_add(1, SeqCst);
        (*block).lock.release();
        (*lkg).lock.release();
    }

    /// Tear the linkage down: strip every block of its theatre state and
    /// dispatch it upward through the owning heap's catch.
    pub(crate) unsafe fn evacuate(lkg: *mut Linkage) {
        (*lkg).lock.acquire();
        let heap = (*lkg).owning_heap.load(SeqCst);
        let index = (*lkg).index;
        let anchor = (*lkg).active.swap(null_mut(), SeqCst);
        if !anchor.is_null() {
            let left = (*anchor).prev;
            let mut block = anchor;
            while !block.is_null() {
                let next = (*block).next;
                Self::evacuate_one(heap, lkg, index, block);
                block = next;
            }
            let mut block = left;
            while !block.is_null() {
                let prev = (*block).prev;
                Self::evacuate_one(heap, lkg, index, block);
                block = prev;
            }
        }
        (*lkg).nblocks.store(0, SeqCst);
        (*lkg).lock.release();
    }

    unsafe fn evacuate_one(heap: *mut Heap, lkg: *mut Linkage, index: usize, block: *mut Block) {
        (*block).lock.acquire();
        (*block).prev = null_mut();
        (*block).next = null_mut();
        (*block)
            .flags
            .fetch_and(!(HEAD | IN_THEATRE | RIGHT_OF_HEAD), SeqCst);
        (*block).owning_tid.store(TID_NONE, SeqCst);
        Heap::catch_block(heap, block, index, lkg);
    }

    // Inspection for tests.

    pub unsafe fn block_count(lkg: *mut Linkage) -> usize {
        (*lkg).nblocks.load(SeqCst)
    }

    pub unsafe fn active_block(lkg: *mut Linkage) -> *mut Block {
        (*lkg).active.load(SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::AllocatorContext;
    use crate::slab::block::block_for;
    use crate::slab::size_to_index;

    // 128-byte objects: 127 per block, so the half-empty threshold is 63.
    const OSIZE: usize = 128;

    /// Allocate `blocks` full blocks' worth of 128-byte objects, returning
    /// the pointers grouped per block in allocation order.
    fn fill_blocks(ctx: &AllocatorContext, heap: *mut Heap, blocks: usize) -> Vec<Vec<*mut u8>> {
        let per_block = crate::slab::block::BLOCK_PAYLOAD_SIZE / OSIZE;
        let mut groups: Vec<Vec<*mut u8>> = Vec::new();
        for _ in 0..blocks {
            let mut group = Vec::with_capacity(per_block);
            for _ in 0..per_block {
                group.push(ctx.allocate_in(heap, OSIZE).unwrap().as_ptr());
            }
            let base = block_for(group[0]);
            assert!(
                group.iter().all(|&p| block_for(p) == base),
                "a full block's worth of allocations spilled into a neighbor"
            );
            groups.push(group);
        }
        groups
    }

    #[test]
    fn half_drain_moves_blocks_right_of_head() {
        unsafe {
            let ctx = AllocatorContext::new();
            let mut heap = ctx.new_child_heap(std::ptr::null_mut());
            let heap = &mut *heap as *mut Heap;
            let groups = fill_blocks(&ctx, heap, 3);
            let lkg = Heap::linkage(heap, size_to_index(OSIZE).unwrap());
            let head = Linkage::active_block(lkg);
            assert_eq!(head, block_for(groups[2][0]));

            // Drain the first block past half; the crossing free reinserts
            // it immediately right of the head with the flag set.
            let b0 = block_for(groups[0][0]);
            for &p in &groups[0][..64] {
                ctx.deallocate(p);
            }
            assert_eq!((*head).next, b0);
            assert_ne!((*b0).flags.load(SeqCst) & RIGHT_OF_HEAD, 0);
            assert_eq!((*b0).prev, head);

            // Blocks strictly left of head carry no RIGHT_OF_HEAD.
            let mut left = (*head).prev;
            while !left.is_null() {
                assert_eq!((*left).flags.load(SeqCst) & RIGHT_OF_HEAD, 0);
                left = (*left).prev;
            }

            // The crossing fires once: draining further does not reshuffle.
            let next_before = (*head).next;
            for &p in &groups[0][64..80] {
                ctx.deallocate(p);
            }
            assert_eq!((*head).next, next_before);

            for group in &groups {
                for &p in group {
                    if !groups[0][..80].contains(&p) {
                        ctx.deallocate(p);
                    }
                }
            }
            ctx.retire_heap(&mut *heap);
            ctx.trim();
        }
    }

    #[test]
    fn slide_excises_residues_without_escalating() {
        unsafe {
            let ctx = AllocatorContext::new();
            let mut heap = ctx.new_child_heap(std::ptr::null_mut());
            let heap = &mut *heap as *mut Heap;
            let groups = fill_blocks(&ctx, heap, 4);
            let lkg = Heap::linkage(heap, size_to_index(OSIZE).unwrap());
            let head = Linkage::active_block(lkg);

            // Move the three older blocks right of head by half-draining
            // them; right chain ends up newest-shift-first: b2, b1, b0.
            let b0 = block_for(groups[0][0]);
            let b1 = block_for(groups[1][0]);
            let b2 = block_for(groups[2][0]);
            for group in &groups[..3] {
                for &p in &group[..64] {
                    ctx.deallocate(p);
                }
            }
            assert_eq!((*head).next, b2);
            assert_eq!((*b2).next, b1);
            assert_eq!((*b1).next, b0);
            assert_eq!(Linkage::block_count(lkg), 4);

            // Make the two nearest right neighbors look like in-flight
            // migrations: both free lists hidden.
            let hidden_b2 = Block::hide_free_lists(b2);
            let hidden_b1 = Block::hide_free_lists(b1);

            let chunks_before = ctx.chunk_count();
            let p = ctx.allocate_in(heap, OSIZE).unwrap().as_ptr();

            // The slide skimmed both residues off and promoted the third
            // neighbor, without pulling from the heap chain.
            assert_eq!(block_for(p), b0);
            assert_eq!(Linkage::active_block(lkg), b0);
            assert_eq!(Linkage::block_count(lkg), 2);
            assert_eq!(ctx.chunk_count(), chunks_before);
            assert!((*b1).prev.is_null() && (*b1).next.is_null());
            assert!((*b2).prev.is_null() && (*b2).next.is_null());

            // Hand the lists back; the excised blocks are then reclaimed by
            // the empty migration as their last objects drain.
            for (block, hidden) in [(b1, hidden_b1), (b2, hidden_b2)] {
                (*block).lock.acquire();
                Block::restore_free_lists(block, hidden.0, hidden.1);
                (*block).lock.release();
            }
            ctx.deallocate(p);
            for group in &groups[..3] {
                for &p in &group[64..] {
                    ctx.deallocate(p);
                }
            }
            for &p in &groups[3] {
                ctx.deallocate(p);
            }
            ctx.retire_heap(&mut *heap);
            ctx.trim();
            assert_eq!(ctx.chunk_count(), 0);
        }
    }

    #[test]
    fn lift_boundary_bounds_the_linkage() {
        unsafe {
            let ctx = AllocatorContext::new();
            let mut heap = ctx.new_child_heap(std::ptr::null_mut());
            let heap = &mut *heap as *mut Heap;
            let groups = fill_blocks(&ctx, heap, 20);
            let lkg = Heap::linkage(heap, size_to_index(OSIZE).unwrap());
            assert_eq!(Linkage::block_count(lkg), 20);

            for group in &groups {
                for &p in group {
                    ctx.deallocate(p);
                }
            }
            // Empties lift upstream while the count sits at or above the
            // boundary, then stay as local inventory.
            assert_eq!(Linkage::block_count(lkg), LIFT_BOUNDARY_SIZED - 1);
            assert!(Linkage::block_count(lkg) <= LIFT_BOUNDARY_SIZED + 1);

            ctx.retire_heap(&mut *heap);
            ctx.trim();
            assert_eq!(ctx.chunk_count(), 0);
        }
    }
}
