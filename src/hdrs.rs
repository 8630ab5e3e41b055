// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The heap index (§4.1): a two-level address -> block-header map giving
//! O(1) header lookup for any interior address, plus the block header
//! itself (§3).

use crate::config::{BOTTOM_SZ, GRANULE_BYTES, HBLKSIZE, LOG_BOTTOM_SZ, LOG_HBLKSIZE, MAX_JUMP};
use crate::error::GcError;
use crate::kinds::KindId;
use crate::mark::Descr;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Header-flag bits (§3).
pub mod flags {
    pub const FREE: u16 = 1 << 0;
    pub const WAS_UNMAPPED: u16 = 1 << 1;
    pub const IGNORE_OFF_PAGE: u16 = 1 << 2;
    pub const HAS_DISCLAIM: u16 = 1 << 3;
    pub const MARK_UNCONDITIONALLY: u16 = 1 << 4;
    pub const LARGE_BLOCK: u16 = 1 << 5;
}

/// A block header (§3). Lives in a `Box` that is never moved once installed
/// in the index; only ever reached through a [`NonNull`] so that forwarding
/// entries and free-list back-pointers remain valid across index mutation.
pub(crate) struct BlockHeader {
    pub kind: KindId,
    /// For in-use blocks: size in bytes of each object. For free blocks:
    /// size in bytes of the whole block.
    pub sz: usize,
    pub descr: Descr,
    pub flags: u16,
    /// One byte per granule; a sentinel byte is always set one past the
    /// last object so sweep loops need no extra bounds check.
    pub marks: Vec<u8>,
    pub n_marks: AtomicUsize,
    /// Per-kind byte-displacement -> granule-offset map; absent for
    /// `LARGE_BLOCK` headers, where every in-block displacement belongs to
    /// the one object starting at offset 0.
    pub map: Option<Arc<[u16]>>,
    pub last_reclaimed: u64,
    pub next: Option<NonNull<BlockHeader>>,
    pub prev: Option<NonNull<BlockHeader>>,
    /// Address of the block this header describes.
    pub block: usize,
}

impl BlockHeader {
    fn new(
        block: usize,
        kind: KindId,
        sz: usize,
        descr: Descr,
        flags: u16,
        n_granules: usize,
        map: Option<Arc<[u16]>>,
    ) -> Box<Self> {
        let mut marks = vec![0u8; n_granules + 1];
        // Sentinel: always "set" one past the last granule so a sweep
        // walking granule-by-granule can stop on an unconditional marks[i]
        // check without a separate bounds test.
        if let Some(last) = marks.last_mut() {
            *last = 1;
        }
        Box::new(BlockHeader {
            kind,
            sz,
            descr,
            flags,
            marks,
            n_marks: AtomicUsize::new(0),
            map,
            last_reclaimed: 0,
            next: None,
            prev: None,
            block,
        })
    }

    pub fn is_free(&self) -> bool {
        self.flags & flags::FREE != 0
    }

    pub fn is_large_block(&self) -> bool {
        self.flags & flags::LARGE_BLOCK != 0
    }

    /// Number of HBLKSIZE-sized blocks this header's allocation spans.
    pub fn n_hblks(&self) -> usize {
        (self.sz + HBLKSIZE - 1) / HBLKSIZE
    }

    pub fn granule_of_displ(&self, displ: usize) -> usize {
        displ / GRANULE_BYTES
    }

    pub fn set_mark_bit(&self, granule: usize) -> bool {
        // Returns true if the bit was already set.
        let was = self.marks[granule];
        if was == 0 {
            // SAFETY: `marks` is only mutated under the mark lock during a
            // cycle; we take &self here because callers hold that lock.
            let ptr = self.marks.as_ptr().add(granule) as *mut u8;
            unsafe { *ptr = 1 };
            self.n_marks.fetch_add(1, Ordering::Relaxed);
            false
        } else {
            true
        }
    }

    pub fn clear_marks(&mut self) {
        for b in self.marks.iter_mut() {
            *b = 0;
        }
        if let Some(last) = self.marks.last_mut() {
            *last = 1;
        }
        self.n_marks.store(0, Ordering::Relaxed);
    }
}

#[derive(Clone, Copy)]
enum BottomEntry {
    Nil,
    /// Displacement, in blocks, back to the block holding the real header.
    Forwarding(NonZeroUsize),
    Header(NonNull<BlockHeader>),
}

struct BottomIndex {
    entries: [BottomEntry; BOTTOM_SZ],
}

impl BottomIndex {
    fn new() -> Box<Self> {
        Box::new(BottomIndex {
            entries: [BottomEntry::Nil; BOTTOM_SZ],
        })
    }
}

fn top_key(block: usize) -> usize {
    block >> (LOG_HBLKSIZE + LOG_BOTTOM_SZ)
}

fn bottom_idx(block: usize) -> usize {
    (block >> LOG_HBLKSIZE) & (BOTTOM_SZ - 1)
}

/// The two-level sparse index itself. Mutated only under the allocator
/// lock (the caller's responsibility; this type does not take its own lock
/// beyond what's needed for interior mutability of the top-level map, since
/// `install_header`/`remove_header`/etc. are always called with the
/// allocator lock already held).
pub(crate) struct HeapIndex {
    top: Mutex<HashMap<usize, Box<BottomIndex>>>,
    /// Every block address currently carrying a primary header, kept sorted
    /// for sweep (§4.7) and mark-stack-overflow rescan (§4.4.4) to walk the
    /// heap in address order without re-deriving it from the hash map.
    blocks: Mutex<BTreeSet<usize>>,
}

impl HeapIndex {
    pub fn new() -> Self {
        HeapIndex {
            top: Mutex::new(HashMap::new()),
            blocks: Mutex::new(BTreeSet::new()),
        }
    }

    /// Calls `f` with every block address holding a primary header, in
    /// ascending order. `f` returning the header pointer lets callers resolve
    /// it without a second lookup.
    pub fn for_each_block(&self, mut f: impl FnMut(usize, NonNull<BlockHeader>)) {
        let addrs: Vec<usize> = self.blocks.lock().iter().copied().collect();
        for block in addrs {
            if let BottomEntry::Header(ptr) = self.get_bottom(block) {
                f(block, ptr);
            }
        }
    }

    fn with_bottom_mut<R>(&self, block: usize, f: impl FnOnce(&mut BottomEntry) -> R) -> R {
        let mut top = self.top.lock();
        let bottom = top.entry(top_key(block)).or_insert_with(BottomIndex::new);
        f(&mut bottom.entries[bottom_idx(block)])
    }

    fn get_bottom(&self, block: usize) -> BottomEntry {
        let top = self.top.lock();
        match top.get(&top_key(block)) {
            Some(bottom) => bottom.entries[bottom_idx(block)],
            None => BottomEntry::Nil,
        }
    }

    /// §4.1 `install_header`. Allocates a fresh header for `block` and
    /// installs it as a real header (not a forwarding entry) in the index.
    pub fn install_header(
        &self,
        block: usize,
        kind: KindId,
        sz: usize,
        descr: Descr,
        flags: u16,
        n_granules: usize,
        map: Option<Arc<[u16]>>,
    ) -> Result<NonNull<BlockHeader>, GcError> {
        let boxed = BlockHeader::new(block, kind, sz, descr, flags, n_granules, map);
        let ptr = NonNull::new(Box::into_raw(boxed)).ok_or(GcError::OutOfMemory)?;
        self.with_bottom_mut(block, |entry| *entry = BottomEntry::Header(ptr));
        self.blocks.lock().insert(block);
        Ok(ptr)
    }

    /// §4.1 `install_counts`. For a multi-block object of total size `sz`
    /// starting at `block`, writes forwarding entries into the `N-1`
    /// bottom-index slots following `block`.
    pub fn install_counts(&self, block: usize, sz: usize) -> Result<(), GcError> {
        let n = (sz + HBLKSIZE - 1) / HBLKSIZE;
        for i in 1..n {
            // Each entry points back exactly `min(i, MAX_JUMP)` blocks. When
            // `i <= MAX_JUMP` that lands directly on the primary header;
            // otherwise it lands on block `i - MAX_JUMP`, which is itself
            // one of the forwarding entries this same loop installs, so
            // `find_starting_hblk`'s chase reaches the primary header in
            // `ceil(i / MAX_JUMP)` hops, however large the object.
            let displ = NonZeroUsize::new(i.min(MAX_JUMP)).unwrap();
            self.with_bottom_mut(block + i * HBLKSIZE, |entry| {
                *entry = BottomEntry::Forwarding(displ)
            });
        }
        Ok(())
    }

    /// §4.1 `remove_header`.
    pub fn remove_header(&self, block: usize) {
        let prev = self.with_bottom_mut(block, |entry| std::mem::replace(entry, BottomEntry::Nil));
        self.blocks.lock().remove(&block);
        if let BottomEntry::Header(ptr) = prev {
            // SAFETY: header was installed via `install_header`, which
            // leaked a `Box<BlockHeader>`; this is the matching free.
            unsafe { drop(Box::from_raw(ptr.as_ptr())) };
        }
    }

    /// §4.1 `remove_counts`, the inverse of `install_counts`.
    pub fn remove_counts(&self, block: usize, sz: usize) {
        let n = (sz + HBLKSIZE - 1) / HBLKSIZE;
        for i in 1..n {
            self.with_bottom_mut(block + i * HBLKSIZE, |entry| *entry = BottomEntry::Nil);
        }
    }

    /// §4.1 `find_starting_hblk`. Chases forwarding entries starting from
    /// block `h` until a real header is found, returning the block address
    /// that header covers and the header pointer itself. Bounds the chase
    /// to guard against a corrupted (cyclic) forwarding chain, aborting with
    /// an `INVARIANT_VIOLATION` per §7 rather than looping forever.
    pub fn find_starting_hblk(&self, mut h: usize) -> Option<(usize, NonNull<BlockHeader>)> {
        let mut steps = 0usize;
        loop {
            match self.get_bottom(h) {
                BottomEntry::Nil => return None,
                BottomEntry::Header(ptr) => return Some((h, ptr)),
                BottomEntry::Forwarding(displ) => {
                    h -= displ.get() * HBLKSIZE;
                    steps += 1;
                    if steps > (1 << 20) {
                        crate::error::abort("heap index forwarding chain did not terminate");
                    }
                }
            }
        }
    }

    /// §4.1 `find_header`. Returns the primary header covering address `p`,
    /// or `None` if `p` is outside any managed block.
    pub fn find_header(&self, p: usize) -> Option<NonNull<BlockHeader>> {
        let block = p & !(HBLKSIZE - 1);
        self.find_starting_hblk(block).map(|(_, hdr)| hdr)
    }

    /// Clears every live header's mark bitmap at once, at the start of a
    /// fresh collection cycle (§4.4.1). Free-block headers carry a mark
    /// bitmap too but it is never consulted, so clearing theirs is harmless.
    pub fn clear_all_marks(&self) {
        let addrs: Vec<usize> = self.blocks.lock().iter().copied().collect();
        for block in addrs {
            if let BottomEntry::Header(ptr) = self.get_bottom(block) {
                // SAFETY: called only at cycle start, before any mark-phase
                // reader has observed this cycle's bitmap state.
                unsafe { (*ptr.as_ptr()).clear_marks() };
            }
        }
    }
}

// SAFETY: all mutation goes through `Mutex`-guarded paths, and `BlockHeader`
// is only ever accessed behind the allocator or mark lock by callers.
unsafe impl Send for HeapIndex {}
unsafe impl Sync for HeapIndex {}

/// Direct-mapped per-thread header-lookup cache (§3 "Header cache"),
/// accelerating `find_header` in the mark loop. Keyed by `addr >>
/// LOG_HBLKSIZE`; invalidated wholesale at collection-cycle boundaries via a
/// generation counter rather than per-entry, since entries are cheap to
/// recompute and invalidation must be correct, not fast.
const CACHE_BITS: usize = 12;
const CACHE_SIZE: usize = 1 << CACHE_BITS;

#[derive(Clone, Copy)]
struct CacheEntry {
    key: usize,
    header: Option<NonNull<BlockHeader>>,
    generation: u64,
}

impl CacheEntry {
    const EMPTY: CacheEntry = CacheEntry {
        key: usize::MAX,
        header: None,
        generation: 0,
    };
}

pub(crate) struct HeaderCache {
    entries: Vec<CacheEntry>,
}

thread_local! {
    static HEADER_CACHE: std::cell::RefCell<HeaderCache> = std::cell::RefCell::new(HeaderCache::new());
}

/// Bumped at the start of every collection cycle; a cache entry tagged with
/// an older generation is treated as a miss.
pub(crate) static CACHE_GENERATION: AtomicUsize = AtomicUsize::new(0);

impl HeaderCache {
    fn new() -> Self {
        HeaderCache {
            entries: vec![CacheEntry::EMPTY; CACHE_SIZE],
        }
    }

    fn slot(key: usize) -> usize {
        key & (CACHE_SIZE - 1)
    }
}

/// Looks up `p`'s header via the calling thread's cache, falling back to
/// `index.find_header` on a miss and populating the cache with the result
/// (including misses, cached as `header: None`, so repeated probes of
/// non-heap words stay O(1)).
pub(crate) fn cached_find_header(index: &HeapIndex, p: usize) -> Option<NonNull<BlockHeader>> {
    let key = p >> LOG_HBLKSIZE;
    let gen = CACHE_GENERATION.load(Ordering::Relaxed) as u64;
    HEADER_CACHE.with(|cache| {
        let mut cache = cache.borrow_mut();
        let slot = HeaderCache::slot(key);
        let entry = cache.entries[slot];
        if entry.key == key && entry.generation == gen {
            return entry.header;
        }
        let header = index.find_header(p);
        cache.entries[slot] = CacheEntry {
            key,
            header,
            generation: gen,
        };
        header
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinds::KindId;
    use crate::mark::Descr;

    #[test]
    fn install_and_find_single_block() {
        let idx = HeapIndex::new();
        let block = 0x1000_0000usize;
        let hdr = idx
            .install_header(block, KindId(0), 64, Descr::length(64), 0, 8, None)
            .unwrap();
        let found = idx.find_header(block + 100).unwrap();
        assert_eq!(found, hdr);
        assert!(idx.find_header(block + HBLKSIZE + 1).is_none());
    }

    #[test]
    fn multi_block_forwarding_chases_to_primary() {
        let idx = HeapIndex::new();
        let block = 0x2000_0000usize;
        let total = HBLKSIZE * 3 + 10;
        let hdr = idx
            .install_header(block, KindId(0), total, Descr::length(total), flags::LARGE_BLOCK, 1, None)
            .unwrap();
        idx.install_counts(block, total).unwrap();
        // An interior pointer into the third block must resolve to the
        // header covering the first block (invariant 1, §8).
        let interior = block + 2 * HBLKSIZE + 5;
        let found = idx.find_header(interior).unwrap();
        assert_eq!(found, hdr);
    }

    #[test]
    fn remove_header_clears_entry() {
        let idx = HeapIndex::new();
        let block = 0x3000_0000usize;
        idx.install_header(block, KindId(0), 64, Descr::length(64), 0, 8, None)
            .unwrap();
        idx.remove_header(block);
        assert!(idx.find_header(block).is_none());
    }

    #[test]
    fn cached_lookup_matches_uncached() {
        let idx = HeapIndex::new();
        let block = 0x4000_0000usize;
        let hdr = idx
            .install_header(block, KindId(0), 64, Descr::length(64), 0, 8, None)
            .unwrap();
        assert_eq!(cached_find_header(&idx, block + 4), Some(hdr));
        // A second lookup should hit the cache and still agree.
        assert_eq!(cached_find_header(&idx, block + 4), Some(hdr));
    }
}
