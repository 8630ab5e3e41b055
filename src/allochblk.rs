// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The block allocator (§4.2): acquires `HBLKSIZE`-aligned memory from the
//! host, hands out contiguous runs of blocks best-fit from a free list, and
//! coalesces neighbouring free runs back together on release.

use crate::config::{DEFAULT_ALLOC_THRESHOLD_PERCENT, HBLKSIZE};
use crate::error::GcError;
use crate::hdrs::{flags, BlockHeader, HeapIndex};
use crate::kinds::KindId;
use crate::mark::Descr;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Host collaborator supplying raw, page-aligned memory (§1A "collaborator
/// traits"). The default [`MmapGetMem`] wraps anonymous `mmap`.
pub trait GetMem: Send + Sync {
    /// Returns a zeroed, `HBLKSIZE`-aligned region of at least `bytes`, or
    /// `None` if the host is out of address space.
    fn get_mem(&self, bytes: usize) -> Option<NonNull<u8>>;
}

pub struct MmapGetMem;

impl GetMem for MmapGetMem {
    fn get_mem(&self, bytes: usize) -> Option<NonNull<u8>> {
        // Over-allocate by one block so the mapping can be shifted forward
        // to an `HBLKSIZE` boundary, then unmap the unused slack on both
        // ends; `mmap` on Linux already returns page-aligned memory and
        // `HBLKSIZE` is a multiple of the page size, so in practice no
        // trimming is needed, but nothing here relies on that.
        let request = bytes + HBLKSIZE;
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                request,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return None;
        }
        let raw = addr as usize;
        let aligned = (raw + HBLKSIZE - 1) & !(HBLKSIZE - 1);
        let front_slack = aligned - raw;
        if front_slack > 0 {
            unsafe { libc::munmap(addr, front_slack) };
        }
        let back_slack = request - front_slack - bytes;
        if back_slack > 0 {
            unsafe { libc::munmap((aligned + bytes) as *mut libc::c_void, back_slack) };
        }
        NonNull::new(aligned as *mut u8)
    }
}

/// A raw, not-yet-headered run of contiguous blocks returned by
/// [`BlockAllocator::allochblk`]. The caller installs whatever header (kind,
/// size, descriptor) its allocation actually needs over this span.
pub(crate) struct RawRun {
    pub addr: usize,
    pub n_hblks: usize,
}

pub(crate) struct BlockAllocator {
    index: std::sync::Arc<HeapIndex>,
    get_mem: std::sync::Arc<dyn GetMem>,
    /// Free runs, keyed by size in `HBLKSIZE` units; addresses within a
    /// bucket are a `BTreeMap` purely to get lowest-address iteration for
    /// free, tie-breaking best-fit toward the lowest address (§4.2).
    free: Mutex<BTreeMap<usize, std::collections::BTreeSet<usize>>>,
    heap_size_bytes: AtomicUsize,
    allocated_since_gc: AtomicUsize,
}

impl BlockAllocator {
    pub fn new(index: std::sync::Arc<HeapIndex>, get_mem: std::sync::Arc<dyn GetMem>) -> Self {
        BlockAllocator {
            index,
            get_mem,
            free: Mutex::new(BTreeMap::new()),
            heap_size_bytes: AtomicUsize::new(0),
            allocated_since_gc: AtomicUsize::new(0),
        }
    }

    pub fn heap_size_bytes(&self) -> usize {
        self.heap_size_bytes.load(Ordering::Relaxed)
    }

    pub fn note_allocated(&self, bytes: usize) {
        self.allocated_since_gc.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn reset_allocated_since_gc(&self) {
        self.allocated_since_gc.store(0, Ordering::Relaxed);
    }

    /// §4.2 `collect_or_expand` heuristic: once allocation since the last
    /// cycle exceeds [`DEFAULT_ALLOC_THRESHOLD_PERCENT`] of current heap
    /// size, prefer triggering a collection over growing the heap further.
    pub fn should_collect_before_expand(&self) -> bool {
        let heap = self.heap_size_bytes.load(Ordering::Relaxed);
        if heap == 0 {
            return false;
        }
        let allocated = self.allocated_since_gc.load(Ordering::Relaxed);
        allocated * 100 >= heap * DEFAULT_ALLOC_THRESHOLD_PERCENT
    }

    fn insert_free(&self, addr: usize, n_hblks: usize) -> Result<(), GcError> {
        self.index
            .install_header(addr, KindId(0), n_hblks * HBLKSIZE, Descr::length(0), flags::FREE, 1, None)?;
        self.index.install_counts(addr, n_hblks * HBLKSIZE)?;
        self.free.lock().entry(n_hblks).or_default().insert(addr);
        Ok(())
    }

    fn take_free(&self, n_hblks: usize, addr: usize) {
        let mut free = self.free.lock();
        if let Some(set) = free.get_mut(&n_hblks) {
            set.remove(&addr);
            if set.is_empty() {
                free.remove(&n_hblks);
            }
        }
        self.index.remove_counts(addr, n_hblks * HBLKSIZE);
        self.index.remove_header(addr);
    }

    /// §4.2 `allochblk`. Best-fit: the smallest free run at least `bytes`
    /// large, lowest address among equals. Splits the run if it is larger
    /// than needed, leaving the remainder as a new, smaller free run.
    pub fn allochblk(&self, bytes: usize) -> Option<RawRun> {
        let n = (bytes + HBLKSIZE - 1) / HBLKSIZE;
        let found = {
            let free = self.free.lock();
            free.range(n..)
                .find_map(|(&sz, set)| set.iter().next().map(|&addr| (sz, addr)))
        };
        let (found_n, addr) = found?;
        self.take_free(found_n, addr);
        let leftover = found_n - n;
        if leftover > 0 {
            let tail = addr + n * HBLKSIZE;
            // A split that fails to re-insert is not fatal to correctness,
            // only to utilisation: the tail stays unindexed and effectively
            // leaks for this run's lifetime, which matches §7's "exhaustion
            // degrades gracefully" stance better than aborting mid-split.
            let _ = self.insert_free(tail, leftover);
        }
        Some(RawRun { addr, n_hblks: n })
    }

    /// §4.2 `expand_hp`. Grows the heap by at least `min_bytes`, rounded up
    /// to a whole number of blocks and up to a minimum expansion increment
    /// so pathological one-block-at-a-time growth doesn't thrash `mmap`.
    pub fn expand_hp(&self, min_bytes: usize) -> Result<(), GcError> {
        const MIN_EXPANSION_HBLKS: usize = 256;
        let n = ((min_bytes + HBLKSIZE - 1) / HBLKSIZE).max(MIN_EXPANSION_HBLKS);
        let bytes = n * HBLKSIZE;
        let mem = self.get_mem.get_mem(bytes).ok_or(GcError::OutOfMemory)?;
        let addr = mem.as_ptr() as usize;
        self.insert_free(addr, n)?;
        self.heap_size_bytes.fetch_add(bytes, Ordering::Relaxed);
        Ok(())
    }

    /// Allocates a run, expanding the heap first if no free run is big
    /// enough. Does not itself decide whether to collect first; that policy
    /// lives with the collector, which calls
    /// [`BlockAllocator::should_collect_before_expand`] before reaching here.
    pub fn allochblk_or_expand(&self, bytes: usize) -> Result<RawRun, GcError> {
        if let Some(run) = self.allochblk(bytes) {
            return Ok(run);
        }
        self.expand_hp(bytes)?;
        self.allochblk(bytes).ok_or(GcError::OutOfMemory)
    }

    /// §4.2 `freehblk`. Releases a primary-headered run back to the free
    /// list, coalescing with an immediately adjacent free run on either side
    /// so fragmentation does not accumulate across cycles.
    pub fn freehblk(&self, header: NonNull<BlockHeader>) {
        let hdr = unsafe { header.as_ref() };
        let mut addr = hdr.block;
        let mut n_hblks = hdr.n_hblks();
        self.index.remove_counts(addr, n_hblks * HBLKSIZE);
        self.index.remove_header(addr);

        // Merge with a free run immediately before this one, if any.
        if let Some(prev_hdr) = self.index.find_header(addr.wrapping_sub(HBLKSIZE)) {
            let prev = unsafe { prev_hdr.as_ref() };
            if prev.is_free() && prev.block + prev.n_hblks() * HBLKSIZE == addr {
                let prev_n = prev.n_hblks();
                let prev_addr = prev.block;
                self.take_free(prev_n, prev_addr);
                addr = prev_addr;
                n_hblks += prev_n;
            }
        }
        // Merge with a free run immediately after.
        if let Some(next_hdr) = self.index.find_header(addr + n_hblks * HBLKSIZE) {
            let next = unsafe { next_hdr.as_ref() };
            if next.is_free() && next.block == addr + n_hblks * HBLKSIZE {
                let next_n = next.n_hblks();
                let next_addr = next.block;
                self.take_free(next_n, next_addr);
                n_hblks += next_n;
            }
        }
        let _ = self.insert_free(addr, n_hblks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct FakeGetMem;
    impl GetMem for FakeGetMem {
        fn get_mem(&self, bytes: usize) -> Option<NonNull<u8>> {
            // Leak a plain boxed, over-aligned buffer; good enough for unit
            // tests that never touch the memory's contents.
            let layout = std::alloc::Layout::from_size_align(bytes, HBLKSIZE).unwrap();
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            NonNull::new(ptr)
        }
    }

    #[test]
    fn allochblk_expands_heap_when_no_free_run_fits() {
        let alloc = BlockAllocator::new(Arc::new(HeapIndex::new()), Arc::new(FakeGetMem));
        let run = alloc.allochblk_or_expand(HBLKSIZE).unwrap();
        assert_eq!(run.n_hblks, 1);
        assert_eq!(run.addr % HBLKSIZE, 0);
    }

    #[test]
    fn split_run_leaves_usable_remainder() {
        let alloc = BlockAllocator::new(Arc::new(HeapIndex::new()), Arc::new(FakeGetMem));
        alloc.expand_hp(HBLKSIZE * 4).unwrap();
        let run = alloc.allochblk(HBLKSIZE).unwrap();
        assert_eq!(run.n_hblks, 1);
        // Three blocks' worth should remain free for a subsequent request.
        let run2 = alloc.allochblk(HBLKSIZE * 3).unwrap();
        assert_eq!(run2.n_hblks, 3);
    }

    #[test]
    fn freehblk_coalesces_adjacent_runs() {
        let alloc = BlockAllocator::new(Arc::new(HeapIndex::new()), Arc::new(FakeGetMem));
        alloc.expand_hp(HBLKSIZE * 2).unwrap();
        let run = alloc.allochblk(HBLKSIZE * 2).unwrap();
        let hdr = alloc
            .index
            .install_header(run.addr, KindId(0), HBLKSIZE * 2, Descr::length(0), 0, 1, None)
            .unwrap();
        alloc.freehblk(hdr);
        // After freeing, a request for the full run must be satisfiable
        // again as one contiguous block rather than two small ones.
        let merged = alloc.allochblk(HBLKSIZE * 2).unwrap();
        assert_eq!(merged.n_hblks, 2);
    }
}
