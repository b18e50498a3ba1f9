//! Anonymous-memory shim. Everything the allocator asks of the OS goes
//! through these three calls; nothing else in the crate touches the
//! virtual-memory interface.

use std::ptr::null_mut;

use rustix::mm::{mmap_anonymous, munmap, MapFlags, ProtFlags};

use crate::{Fault, PAGE_SIZE};

/// Reserve and commit `size` bytes of zero-filled anonymous memory.
pub fn map_pages(size: usize) -> Result<*mut u8, Fault> {
    let memory = unsafe {
        mmap_anonymous(
            null_mut(),
            size,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::PRIVATE,
        )
    }
    .map_err(|err| {
        if err.raw_os_error() == libc::ENOMEM {
            eprintln!("stratalloc: mmap failed for size={size:#x}: out of memory");
        } else {
            eprintln!("stratalloc: mmap failed for size={size:#x}: {err}");
        }
        Fault::MapFailed
    })?;
    Ok(memory as *mut u8)
}

/// Like [`map_pages`], with the base aligned to `align` (a power of two,
/// at least a page). Over-maps by `align` minus a page and trims the
/// unaligned prefix and the tail back off.
pub fn map_pages_aligned(size: usize, align: usize) -> Result<*mut u8, Fault> {
    debug_assert!(align.is_power_of_two() && align >= PAGE_SIZE);

    let mapped = size + align - PAGE_SIZE;
    let swath = map_pages(mapped)?;

    let addr = swath as usize;
    let offset = addr & (align - 1);
    let lead = if offset != 0 { align - offset } else { 0 };
    unsafe {
        if lead != 0 {
            let _ = munmap(swath as *mut _, lead);
        }
        let tail = mapped - lead - size;
        if tail != 0 {
            let _ = munmap(swath.add(lead + size) as *mut _, tail);
        }
    }
    Ok(unsafe { swath.add(lead) })
}

/// Release a mapping (or any page-aligned sub-range of one).
///
/// Failure is reported and the range is considered leaked; the caller
/// carries on either way.
pub fn unmap_pages(base: *mut u8, size: usize) {
    if let Err(err) = unsafe { munmap(base as *mut _, size) } {
        eprintln!("stratalloc: munmap failed at {base:p} for size={size:#x}: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CHUNK_SIZE;

    #[test]
    fn aligned_map_is_aligned() {
        for _ in 0..4 {
            let base = map_pages_aligned(CHUNK_SIZE, CHUNK_SIZE).unwrap();
            assert_eq!(base as usize & (CHUNK_SIZE - 1), 0);
            // Zero-filled and writable end to end.
            unsafe {
                assert_eq!(*base, 0);
                assert_eq!(*base.add(CHUNK_SIZE - 1), 0);
                *base = 0xA5;
                *base.add(CHUNK_SIZE - 1) = 0x5A;
            }
            unmap_pages(base, CHUNK_SIZE);
        }
    }

    #[test]
    fn plain_map_round_trip() {
        let base = map_pages(PAGE_SIZE * 4).unwrap();
        unsafe { std::ptr::write_bytes(base, 0xFF, PAGE_SIZE * 4) };
        unmap_pages(base, PAGE_SIZE * 4);
    }
}
