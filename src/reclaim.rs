// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Reclaim / sweep (§4.7): after a mark phase completes, every block is
//! reclassified fully-live, fully-dead, or mixed, and the kind free lists are
//! rebuilt from scratch rather than appended to.
//!
//! Rebuild-not-append matters: if sweep instead threaded a block's currently
//! free slots onto whatever was already on the kind's free list at the start
//! of the cycle, a slot that was already sitting unallocated at the previous
//! sweep (and therefore already on that stale chain) would get threaded on a
//! second time, corrupting the list into one address reachable from two
//! places. `start_reclaim` resets every kind's free-list heads to empty, and
//! `continue_reclaim` re-derives each block's free slots from its mark
//! bitmap (the one source of truth for which slots are currently live) as it
//! walks the per-kind reclaim queue.

use crate::allochblk::BlockAllocator;
use crate::config::{GRANULE_BYTES, HBLKSIZE, MAXOBJGRANULES};
use crate::hdrs::{BlockHeader, HeapIndex};
use crate::kinds::{KindId, KindTable, KIND_UNCOLLECTABLE};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub(crate) struct Reclaimer {
    index: Arc<HeapIndex>,
    kinds: Arc<KindTable>,
    blocks: Arc<BlockAllocator>,
    cycle: AtomicU64,
}

impl Reclaimer {
    pub fn new(index: Arc<HeapIndex>, kinds: Arc<KindTable>, blocks: Arc<BlockAllocator>) -> Self {
        Reclaimer {
            index,
            kinds,
            blocks,
            cycle: AtomicU64::new(0),
        }
    }

    /// §4.7 `start_reclaim`. `KIND_UNCOLLECTABLE` is never queued or reset:
    /// its objects live outside the sweep entirely (see
    /// `collector::gcollect`, which pushes their contents as roots every
    /// cycle instead), so resetting its free list here would orphan whatever
    /// slots happened to be unallocated at the time.
    pub fn start_reclaim(&self) {
        self.cycle.fetch_add(1, Ordering::Relaxed);
        let n_kinds = self.kinds.len();
        for k in 0..n_kinds {
            let kind = KindId(k as u8);
            if kind == KIND_UNCOLLECTABLE {
                continue;
            }
            self.reset_kind_for_sweep(kind);
        }
        let mut pending: Vec<(KindId, usize, NonNull<BlockHeader>)> = Vec::new();
        self.index.for_each_block(|_addr, hdr_ptr| {
            let hdr = unsafe { hdr_ptr.as_ref() };
            if hdr.is_free() || hdr.is_large_block() || hdr.kind == KIND_UNCOLLECTABLE {
                return;
            }
            let granules = (hdr.sz / GRANULE_BYTES).clamp(1, MAXOBJGRANULES);
            pending.push((hdr.kind, granules, hdr_ptr));
        });
        for (kind, granules, hdr_ptr) in pending {
            self.queue_reclaim(kind, granules, hdr_ptr);
        }
    }

    fn reset_kind_for_sweep(&self, kind: KindId) {
        self.kinds.with_kind(kind, |k| {
            for head in k.freelist.iter() {
                head.store(std::ptr::null_mut(), Ordering::Release);
            }
            for rl in k.reclaim_list.iter() {
                *rl.lock() = None;
            }
        });
    }

    fn queue_reclaim(&self, kind: KindId, granules: usize, hdr_ptr: NonNull<BlockHeader>) {
        self.kinds.with_kind(kind, |k| {
            let mut head = k.reclaim_list[granules].lock();
            // SAFETY: `next` is only ever touched by whichever thread holds
            // the allocator lock, which every reclaim entry point requires.
            unsafe { (*hdr_ptr.as_ptr()).next = *head };
            *head = Some(hdr_ptr);
        });
    }

    /// §4.7 `continue_reclaim`. Pops and sweeps one queued block of `(kind,
    /// granules)`. Returns `false` once the queue for that bucket is empty,
    /// letting a caller drive the sweep incrementally a block at a time.
    pub fn continue_reclaim(&self, kind: KindId, granules: usize) -> bool {
        let granules = granules.min(MAXOBJGRANULES);
        let popped = self.kinds.with_kind(kind, |k| {
            let mut head = k.reclaim_list[granules].lock();
            let hdr_ptr = *head;
            if let Some(p) = hdr_ptr {
                *head = unsafe { (*p.as_ptr()).next };
            }
            hdr_ptr
        });
        let Some(hdr_ptr) = popped else {
            return false;
        };
        self.sweep_small_block(kind, granules, hdr_ptr);
        let cycle = self.cycle.load(Ordering::Relaxed);
        unsafe { (*hdr_ptr.as_ptr()).last_reclaimed = cycle };
        true
    }

    /// §4.7 `reclaim_generic`: drains the whole `(kind, granules)` queue in
    /// one call, for callers that want an eager (non-incremental) sweep of a
    /// single bucket.
    pub fn reclaim_generic(&self, kind: KindId, granules: usize) {
        while self.continue_reclaim(kind, granules) {}
    }

    /// §4.7 `reclaim_all`. Sweeps every collectable kind's small-object
    /// buckets plus every large block, checking `stop_fn` between blocks so
    /// a caller (`gcollect_maybe`) can abandon an in-progress sweep. This
    /// crate has no block-aging scheme, so `ignore_old` (bdwgc: reclaim
    /// blocks even if they weren't touched since the last GC) has nothing to
    /// opt out of — every block queued by `start_reclaim` is swept exactly
    /// once regardless of its value.
    pub fn reclaim_all(&self, stop_fn: impl Fn() -> bool, ignore_old: bool) -> bool {
        let _ = ignore_old;
        let n_kinds = self.kinds.len();
        for k in 0..n_kinds {
            let kind = KindId(k as u8);
            if kind == KIND_UNCOLLECTABLE {
                continue;
            }
            for granules in 0..=MAXOBJGRANULES {
                loop {
                    if stop_fn() {
                        return false;
                    }
                    if !self.continue_reclaim(kind, granules) {
                        break;
                    }
                }
            }
        }
        self.reclaim_large_blocks(&stop_fn)
    }

    fn reclaim_large_blocks(&self, stop_fn: &impl Fn() -> bool) -> bool {
        let mut candidates = Vec::new();
        self.index.for_each_block(|_addr, hdr_ptr| {
            let hdr = unsafe { hdr_ptr.as_ref() };
            if hdr.is_free() || !hdr.is_large_block() || hdr.kind == KIND_UNCOLLECTABLE {
                return;
            }
            candidates.push(hdr_ptr);
        });
        for hdr_ptr in candidates {
            if stop_fn() {
                return false;
            }
            self.sweep_large_block(hdr_ptr);
        }
        true
    }

    /// Rebuilds one small-object block's free chain from its mark bitmap.
    /// `disclaim`, if the kind has one registered, gets first refusal on
    /// every currently-unmarked slot: returning `true` resurrects the object
    /// (marked, kept out of the free list) for one more cycle, mirroring
    /// `GC_finalized_disclaim`'s contract in the original C collector this
    /// crate's finalization layer is grounded on.
    fn sweep_small_block(&self, kind: KindId, granules: usize, hdr_ptr: NonNull<BlockHeader>) {
        let hdr = unsafe { hdr_ptr.as_ref() };
        let obj_bytes = hdr.sz;
        if obj_bytes == 0 {
            return;
        }
        let n_objs = HBLKSIZE / obj_bytes;
        let granule_stride = obj_bytes / GRANULE_BYTES;
        let disclaim = self.kinds.with_kind(kind, |k| k.disclaim.clone());

        if let Some(proc) = &disclaim {
            for i in 0..n_objs {
                let granule = i * granule_stride;
                if hdr.marks[granule] != 0 {
                    continue;
                }
                let obj_addr = hdr.block + i * obj_bytes;
                let ptr = unsafe { NonNull::new_unchecked(obj_addr as *mut u8) };
                if proc(ptr) {
                    set_mark_unlocked(hdr, granule);
                }
            }
        }

        let n_marks = hdr.n_marks.load(Ordering::Relaxed);
        if n_marks == n_objs {
            return;
        }
        if n_marks == 0 {
            self.blocks.freehblk(hdr_ptr);
            return;
        }
        for i in 0..n_objs {
            let granule = i * granule_stride;
            if hdr.marks[granule] == 0 {
                let obj_addr = hdr.block + i * obj_bytes;
                let ptr = unsafe { NonNull::new_unchecked(obj_addr as *mut u8) };
                self.kinds.push_freelist(kind, granules, ptr);
            }
        }
    }

    fn sweep_large_block(&self, hdr_ptr: NonNull<BlockHeader>) {
        let hdr = unsafe { hdr_ptr.as_ref() };
        if hdr.n_marks.load(Ordering::Relaxed) != 0 {
            let cycle = self.cycle.load(Ordering::Relaxed);
            unsafe { (*hdr_ptr.as_ptr()).last_reclaimed = cycle };
            return;
        }
        let disclaim = self.kinds.with_kind(hdr.kind, |k| k.disclaim.clone());
        if let Some(proc) = &disclaim {
            let ptr = unsafe { NonNull::new_unchecked(hdr.block as *mut u8) };
            if proc(ptr) {
                set_mark_unlocked(hdr, 0);
                let cycle = self.cycle.load(Ordering::Relaxed);
                unsafe { (*hdr_ptr.as_ptr()).last_reclaimed = cycle };
                return;
            }
        }
        self.blocks.freehblk(hdr_ptr);
    }
}

/// Sets a mark bit outside the ordinary `push_contents_hdr` path (the
/// disclaim callback resurrecting an object happens during sweep, after
/// marking has already finished). Only ever called while the allocator lock
/// is held, same as every other header mutation in this module.
fn set_mark_unlocked(hdr: &BlockHeader, granule: usize) {
    if hdr.marks[granule] == 0 {
        let ptr = hdr.marks.as_ptr().wrapping_add(granule) as *mut u8;
        unsafe { *ptr = 1 };
        hdr.n_marks.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allochblk::MmapGetMem;
    use crate::freelist::Allocator as FreeListAllocator;
    use crate::kinds::{KindTable, KIND_NORMAL};
    use crate::mark::MarkEngine;
    use std::sync::atomic::AtomicUsize;

    struct Harness {
        index: Arc<HeapIndex>,
        kinds: Arc<KindTable>,
        blocks: Arc<BlockAllocator>,
        alloc: FreeListAllocator,
        reclaim: Reclaimer,
    }

    impl Harness {
        fn new() -> Self {
            let index = Arc::new(HeapIndex::new());
            let kinds = Arc::new(KindTable::new());
            let blocks = Arc::new(BlockAllocator::new(index.clone(), Arc::new(MmapGetMem)));
            let alloc = FreeListAllocator::new(index.clone(), kinds.clone(), blocks.clone());
            let reclaim = Reclaimer::new(index.clone(), kinds.clone(), blocks.clone());
            Harness { index, kinds, blocks, alloc, reclaim }
        }

        fn mark(&self, addr: usize) {
            let engine = MarkEngine::new(1024);
            engine.push_contents_hdr(addr, &self.index, true, false);
        }
    }

    #[test]
    fn fully_dead_block_returns_to_block_allocator() {
        let h = Harness::new();
        let a = h.alloc.generic_malloc_inner(32, KIND_NORMAL).unwrap();
        assert!(h.index.find_header(a.as_ptr() as usize).is_some());
        h.reclaim.start_reclaim();
        h.reclaim.reclaim_generic(KIND_NORMAL, 32 / GRANULE_BYTES);
        assert!(h.index.find_header(a.as_ptr() as usize).is_none());
    }

    #[test]
    fn live_object_survives_sweep_and_dead_sibling_is_refreed() {
        let h = Harness::new();
        let live = h.alloc.generic_malloc_inner(32, KIND_NORMAL).unwrap();
        let _dead = h.alloc.generic_malloc_inner(32, KIND_NORMAL).unwrap();
        h.mark(live.as_ptr() as usize);
        h.reclaim.start_reclaim();
        h.reclaim.reclaim_generic(KIND_NORMAL, 32 / GRANULE_BYTES);
        assert!(h.index.find_header(live.as_ptr() as usize).is_some());
        // The block itself should still be indexed (partially live), and the
        // freed sibling's address reusable via a fresh allocation.
        let reused = h.alloc.generic_malloc_inner(32, KIND_NORMAL).unwrap();
        assert_ne!(reused.as_ptr(), live.as_ptr());
    }

    #[test]
    fn disclaim_can_resurrect_an_unmarked_object() {
        let h = Harness::new();
        let resurrections = Arc::new(AtomicUsize::new(0));
        let kind = h
            .kinds
            .new_kind(crate::kinds::new_free_list(), crate::mark::Descr::length(16), false, false)
            .unwrap();
        let counter = resurrections.clone();
        h.kinds
            .register_disclaim_proc(
                kind,
                Arc::new(move |_obj| {
                    counter.fetch_add(1, Ordering::Relaxed);
                    true
                }),
                false,
            )
            .unwrap();
        let obj = h.alloc.generic_malloc_inner(16, kind).unwrap();
        // Never marked: disclaim alone decides its fate. The proc here
        // unconditionally keeps whatever it's handed (unlike a real
        // finalizer, which would check a tag bit), so it also runs against
        // every other never-allocated slot `build_fl` threaded into the same
        // block — the point of this test is that the registered object's
        // block survives the sweep, not an exact call count.
        h.reclaim.start_reclaim();
        h.reclaim.reclaim_generic(kind, 16 / GRANULE_BYTES);
        assert!(resurrections.load(Ordering::Relaxed) >= 1);
        assert!(h.index.find_header(obj.as_ptr() as usize).is_some());
    }
}
