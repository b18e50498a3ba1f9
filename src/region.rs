//! Regional-heap slot pool. Regional heaps sit between thread heaps and
//! the root; their storage comes from pages carved into heap-sized slots
//! on a freelist, so creating and destroying regions never touches the
//! allocator's own block machinery.

use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, Ordering::SeqCst};

use crate::internals::{align_to, SpinLock};
use crate::slab::chunk::ChunkTracker;
use crate::slab::heap::Heap;
use crate::sys;
use crate::{Fault, PAGE_SIZE};

const REGION_PAGE_SIZE: usize = 4 * PAGE_SIZE;
const SLOT_SIZE: usize = align_to(size_of::<Heap>(), 64);
/// First slot-sized cell of each page holds the next-page link.
const SLOTS_PER_PAGE: usize = REGION_PAGE_SIZE / SLOT_SIZE - 1;

pub struct RegionPool {
    lock: SpinLock,
    freelist: AtomicPtr<u8>,
    pages: AtomicPtr<u8>,
}

// Slots are handed out and mutated only under the pool lock or as
// exclusively-owned heaps.
unsafe impl Send for RegionPool {}
unsafe impl Sync for RegionPool {}

impl RegionPool {
    pub const fn new() -> Self {
        RegionPool {
            lock: SpinLock::new(),
            freelist: AtomicPtr::new(null_mut()),
            pages: AtomicPtr::new(null_mut()),
        }
    }

    /// Map a page, link it into the page list, and thread its slots onto
    /// the freelist. Caller holds the pool lock.
    unsafe fn grow(&self) -> Result<(), Fault> {
        let page = sys::map_pages(REGION_PAGE_SIZE)?;
        *(page as *mut *mut u8) = self.pages.load(SeqCst);
        self.pages.store(page, SeqCst);

        let slots = page.add(SLOT_SIZE);
        for i in 0..SLOTS_PER_PAGE - 1 {
            *(slots.add(i * SLOT_SIZE) as *mut *mut u8) = slots.add((i + 1) * SLOT_SIZE);
        }
        *(slots.add((SLOTS_PER_PAGE - 1) * SLOT_SIZE) as *mut *mut u8) =
            self.freelist.load(SeqCst);
        self.freelist.store(slots, SeqCst);
        Ok(())
    }

    /// Take a slot and initialize a regional heap in it, parented to
    /// `root`.
    pub(crate) unsafe fn create(
        &self,
        root: *mut Heap,
        tracker: *const ChunkTracker,
    ) -> Result<*mut Heap, Fault> {
        self.lock.acquire();
        if self.freelist.load(SeqCst).is_null() {
            if let Err(fault) = self.grow() {
                self.lock.release();
                return Err(fault);
            }
        }
        let slot = self.freelist.load(SeqCst);
        self.freelist.store(*(slot as *mut *mut u8), SeqCst);
        self.lock.release();

        let heap = slot as *mut Heap;
        Heap::init_in_place(heap, root, tracker);
        Ok(heap)
    }

    /// Evacuate the regional heap and return its slot to the freelist.
    pub(crate) unsafe fn destroy(&self, heap: *mut Heap) {
        Heap::evacuate(heap);
        let slot = heap as *mut u8;
        std::ptr::write_bytes(slot, 0, SLOT_SIZE);
        self.lock.acquire();
        *(slot as *mut *mut u8) = self.freelist.load(SeqCst);
        self.freelist.store(slot, SeqCst);
        self.lock.release();
    }
}

impl Default for RegionPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RegionPool {
    fn drop(&mut self) {
        let mut page = self.pages.load(SeqCst);
        while !page.is_null() {
            let next = unsafe { *(page as *mut *mut u8) };
            sys::unmap_pages(page, REGION_PAGE_SIZE);
            page = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr::null_mut;

    #[test]
    fn slots_fit_heaps() {
        assert!(SLOT_SIZE >= size_of::<Heap>());
        assert!(SLOTS_PER_PAGE >= 1);
    }

    #[test]
    fn destroyed_slots_are_reused() {
        unsafe {
            let tracker = ChunkTracker::new();
            let pool = RegionPool::new();
            let first = pool.create(null_mut(), &tracker).unwrap();
            pool.destroy(first);
            let second = pool.create(null_mut(), &tracker).unwrap();
            assert_eq!(first, second);
            pool.destroy(second);
        }
    }
}
