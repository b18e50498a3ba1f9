//! Memory gives itself back: blocks reformat across size classes through
//! the unsized pool, drained chunks unmap, and freed pointers only ever
//! come back through allocate.

use std::collections::HashSet;
use std::ptr::null_mut;

use stratalloc::slab::block::Block;
use stratalloc::{block_for, AllocatorContext};

#[test]
fn chunks_unmap_as_pools_drain() {
    let ctx = AllocatorContext::new();
    let mut heap = ctx.new_child_heap(null_mut());
    let heap_ptr = &mut *heap as *mut _;

    // 189 blocks of 128-byte objects: exactly three chunks.
    let count = 24_000;
    let objects: Vec<*mut u8> = (0..count)
        .map(|_| ctx.allocate_in(heap_ptr, 128).unwrap().as_ptr())
        .collect();
    assert_eq!(ctx.chunk_count(), 3);

    for &p in &objects {
        ctx.deallocate(p);
    }
    ctx.retire_heap(&mut heap);
    // The root's unsized pool retains up to its boundary; everything past
    // it was freed block by block, which fully drained the youngest chunk.
    assert!(ctx.chunk_count() <= 2, "no chunk was reclaimed by the drain");

    ctx.trim();
    assert_eq!(ctx.chunk_count(), 0, "tracker should be empty after trim");
}

#[test]
fn blocks_reformat_across_classes() {
    let ctx = AllocatorContext::new();
    let mut first = ctx.new_child_heap(null_mut());
    let first_ptr = &mut *first as *mut _;

    let p1 = ctx.allocate_in(first_ptr, 24).unwrap().as_ptr();
    let b = block_for(p1);
    unsafe {
        assert_eq!(Block::object_size(b), 24);
    }
    ctx.deallocate(p1);
    // Lift the emptied class-2 block into the root's unsized pool.
    ctx.retire_heap(&mut first);

    // A different heap asking for class-9 objects will cycle the pool;
    // when our block comes around it must have been reformatted.
    let mut second = ctx.new_child_heap(null_mut());
    let second_ptr = &mut *second as *mut _;
    let mut held = Vec::new();
    let mut found = false;
    for _ in 0..64 * 64 {
        let p = ctx.allocate_in(second_ptr, 256).unwrap().as_ptr();
        held.push(p);
        if block_for(p) == b {
            found = true;
            break;
        }
    }
    assert!(found, "freed block never cycled back out of the pool");
    unsafe {
        assert_eq!(Block::object_size(b), 256);
        assert!(Block::object_capacity(b) > 0);
    }

    for p in held {
        ctx.deallocate(p);
    }
    ctx.retire_heap(&mut second);
    ctx.trim();
    assert_eq!(ctx.chunk_count(), 0);
}

#[test]
fn freed_pointers_only_return_via_allocate() {
    let ctx = AllocatorContext::new();
    let mut heap = ctx.new_child_heap(null_mut());
    let heap_ptr = &mut *heap as *mut _;

    let mut live = HashSet::new();
    let mut first_batch = Vec::new();
    for _ in 0..1_000 {
        let p = ctx.allocate_in(heap_ptr, 64).unwrap().as_ptr() as usize;
        assert!(live.insert(p));
        first_batch.push(p);
    }

    // Free every other pointer.
    let mut freed = HashSet::new();
    for p in first_batch.iter().step_by(2) {
        ctx.deallocate(*p as *mut u8);
        live.remove(p);
        freed.insert(*p);
    }

    // New allocations never collide with a live pointer; reuse of freed
    // addresses is the only way an old pointer reappears.
    let mut reused = 0;
    let mut second_batch = Vec::new();
    for _ in 0..600 {
        let p = ctx.allocate_in(heap_ptr, 64).unwrap().as_ptr() as usize;
        assert!(live.insert(p), "allocator served a live pointer twice");
        if freed.contains(&p) {
            reused += 1;
        }
        second_batch.push(p);
    }
    assert!(reused > 0, "drained slots never reused");

    for p in live {
        ctx.deallocate(p as *mut u8);
    }
    ctx.retire_heap(&mut heap);
    ctx.trim();
    assert_eq!(ctx.chunk_count(), 0);
}
