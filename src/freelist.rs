// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Small-object allocation (§4.3): the size map drives a per-kind,
//! per-granule free list; an empty free list is refilled one whole block at
//! a time (`build_fl`, bdwgc's `generic_malloc_many`) rather than one object
//! at a time, amortising the allocator lock and heap-index insertion cost
//! across many future allocations.

use crate::allochblk::BlockAllocator;
use crate::config::{GRANULE_BYTES, HBLKSIZE, MAXOBJGRANULES};
use crate::error::GcError;
use crate::hdrs::{flags, HeapIndex};
use crate::kinds::{bytes_to_granules, granules_to_bytes, KindId, KindTable};
use crate::mark::Descr;
use std::ptr::NonNull;
use std::sync::Arc;

pub(crate) struct Allocator {
    index: Arc<HeapIndex>,
    kinds: Arc<KindTable>,
    blocks: Arc<BlockAllocator>,
}

/// Builds the per-word -> owning-granule-offset map for a block sliced into
/// equal-sized objects (§4.1 "map"). Words past the last whole object (slack
/// left when `obj_bytes` doesn't evenly divide `HBLKSIZE`) map to
/// `u16::MAX`, rejected by `mark::push_contents_hdr` as not belonging to any
/// object.
fn build_offset_map(obj_bytes: usize) -> Arc<[u16]> {
    let words_per_block = HBLKSIZE / std::mem::size_of::<usize>();
    let words_per_obj = obj_bytes / std::mem::size_of::<usize>();
    let n_objs = HBLKSIZE / obj_bytes;
    (0..words_per_block)
        .map(|w| {
            let obj_idx = w / words_per_obj;
            if obj_idx < n_objs {
                ((obj_idx * words_per_obj * std::mem::size_of::<usize>()) / GRANULE_BYTES) as u16
            } else {
                u16::MAX
            }
        })
        .collect()
}

impl Allocator {
    pub fn new(index: Arc<HeapIndex>, kinds: Arc<KindTable>, blocks: Arc<BlockAllocator>) -> Self {
        Allocator { index, kinds, blocks }
    }

    /// §4.3 `generic_malloc_inner`. `bytes == 0` is treated as a one-byte
    /// request, so a zero-size allocation still returns a distinct,
    /// freeable pointer rather than a shared sentinel.
    pub fn generic_malloc_inner(&self, bytes: usize, kind: KindId) -> Result<NonNull<u8>, GcError> {
        let bytes = bytes.max(1);
        if bytes > crate::config::MAXOBJBYTES {
            return self.large_alloc(bytes, kind);
        }
        let granules = bytes_to_granules(bytes);
        if let Some(ptr) = self.kinds.pop_freelist(kind, granules) {
            self.after_alloc(kind, granules_to_bytes(granules));
            return Ok(ptr);
        }
        self.build_fl(kind, granules)?;
        let ptr = self
            .kinds
            .pop_freelist(kind, granules)
            .ok_or(GcError::OutOfMemory)?;
        self.after_alloc(kind, granules_to_bytes(granules));
        Ok(ptr)
    }

    fn after_alloc(&self, _kind: KindId, bytes: usize) {
        self.blocks.note_allocated(bytes);
    }

    fn descr_for(&self, kind: KindId, obj_bytes: usize) -> Descr {
        self.kinds
            .with_kind(kind, |k| if k.relocate_descr { Descr::length(obj_bytes) } else { k.descr_template })
    }

    /// §4.3 large-object path: requests that don't fit the small-object size
    /// map (`granules > MAXOBJGRANULES`) go straight to the block allocator
    /// and get a dedicated `LARGE_BLOCK` header.
    fn large_alloc(&self, bytes: usize, kind: KindId) -> Result<NonNull<u8>, GcError> {
        let run = self.blocks.allochblk_or_expand(bytes)?;
        let descr = self.descr_for(kind, bytes);
        self.index
            .install_header(run.addr, kind, bytes, descr, flags::LARGE_BLOCK, 1, None)?;
        self.index.install_counts(run.addr, run.n_hblks * HBLKSIZE)?;
        let count = crate::config::note_large_alloc();
        let warn_every = crate::config::large_alloc_warn_interval();
        if warn_every != 0 && count % warn_every == 0 {
            log::warn!("{} large allocations (>{} bytes) so far", count, crate::config::MAXOBJBYTES);
        }
        self.blocks.note_allocated(run.n_hblks * HBLKSIZE);
        NonNull::new(run.addr as *mut u8).ok_or(GcError::OutOfMemory)
    }

    /// §4.3 `build_fl` / `generic_malloc_many`. Opens one fresh block for
    /// `(kind, granules)`, installs a header covering the whole block with a
    /// precomputed byte-displacement map, slices it into equal-sized object
    /// slots, and pushes every slot onto the kind's free list in one batch.
    fn build_fl(&self, kind: KindId, granules: usize) -> Result<(), GcError> {
        debug_assert!(granules <= MAXOBJGRANULES);
        let obj_bytes = granules_to_bytes(granules);
        let run = self.blocks.allochblk_or_expand(HBLKSIZE)?;
        debug_assert_eq!(run.n_hblks, 1, "small-object blocks are always exactly one HBLKSIZE");

        let descr = self.descr_for(kind, obj_bytes);
        let map = build_offset_map(obj_bytes);
        let n_granules_in_block = HBLKSIZE / GRANULE_BYTES;
        self.index
            .install_header(run.addr, kind, obj_bytes, descr, 0, n_granules_in_block, Some(map))?;

        let n_objs = HBLKSIZE / obj_bytes;
        for i in 0..n_objs {
            let obj_addr = run.addr + i * obj_bytes;
            // SAFETY: the block was just acquired from the block allocator
            // and is not yet reachable from any other thread; writing the
            // free-list link into its first word is the establishing write
            // for the intrusive list (§4.3 "first word is the link").
            let ptr = unsafe { NonNull::new_unchecked(obj_addr as *mut u8) };
            self.kinds.push_freelist(kind, granules, ptr);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinds::{KIND_NORMAL, KIND_PTRFREE};

    fn new_allocator() -> Allocator {
        let index = Arc::new(HeapIndex::new());
        let kinds = Arc::new(KindTable::new());
        let blocks = Arc::new(BlockAllocator::new(index.clone(), Arc::new(crate::allochblk::MmapGetMem)));
        Allocator::new(index, kinds, blocks)
    }

    #[test]
    fn small_alloc_refills_and_serves_many_requests() {
        let alloc = new_allocator();
        let a = alloc.generic_malloc_inner(16, KIND_NORMAL).unwrap();
        let b = alloc.generic_malloc_inner(16, KIND_NORMAL).unwrap();
        assert_ne!(a.as_ptr(), b.as_ptr());
    }

    #[test]
    fn ptrfree_alloc_is_independent_of_normal_freelist() {
        let alloc = new_allocator();
        let a = alloc.generic_malloc_inner(16, KIND_NORMAL).unwrap();
        let b = alloc.generic_malloc_inner(16, KIND_PTRFREE).unwrap();
        assert_ne!(a.as_ptr(), b.as_ptr());
    }

    #[test]
    fn large_alloc_bypasses_free_list() {
        let alloc = new_allocator();
        let ptr = alloc.generic_malloc_inner(crate::config::MAXOBJBYTES + 1, KIND_NORMAL).unwrap();
        let hdr = alloc.index.find_header(ptr.as_ptr() as usize).unwrap();
        assert!(unsafe { hdr.as_ref() }.is_large_block());
    }
}
