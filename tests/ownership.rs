//! Ownership round-trip: a block freed back to the root pool carries no
//! owner, and whoever pulls it to serve as a head becomes its owner.

use std::sync::mpsc;
use std::thread;

use stratalloc::slab::block::Block;
use stratalloc::tid;
use stratalloc::{allocate, block_for, deallocate, thread_detach};

#[test]
fn ownership_follows_the_serving_thread() {
    let (tx, rx) = mpsc::channel::<usize>();

    let first = thread::spawn(move || {
        let p = allocate(64).unwrap().as_ptr();
        let block = block_for(p) as usize;
        assert_eq!(
            unsafe { Block::owning_thread_id(block as *mut Block) },
            tid::current()
        );
        deallocate(p);
        // Evacuating the heap lifts the emptied block into the root pool
        // and clears its owner.
        thread_detach();
        tx.send(block).unwrap();
    });
    first.join().unwrap();
    let block = rx.recv().unwrap();
    assert_eq!(unsafe { Block::owning_thread_id(block as *mut Block) }, 0);

    let second = thread::spawn(move || {
        // Pull blocks until the pooled one comes around again; whichever
        // thread serves from the head position owns it.
        let mut held = Vec::new();
        let mut found = false;
        for _ in 0..64 * 256 {
            let p = allocate(64).unwrap().as_ptr();
            held.push(p);
            if block_for(p) as usize == block {
                found = true;
                break;
            }
        }
        assert!(found, "pooled block never came back around");
        assert_eq!(
            unsafe { Block::owning_thread_id(block as *mut Block) },
            tid::current()
        );
        for p in held {
            deallocate(p);
        }
    });
    second.join().unwrap();
}
