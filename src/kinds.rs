// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Object kinds (§3 "Object kinds") and the small-object size map (§4.3).

use crate::config::{GRANULE_BYTES, MAXOBJGRANULES, MAXOBJKINDS};
use crate::error::GcError;
use crate::hdrs::BlockHeader;
use crate::mark::Descr;
use parking_lot::Mutex;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

/// Identifies a registered kind (§3 "a small integer indexing the kind
/// table").
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct KindId(pub(crate) u8);

impl KindId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Built-in kinds every collector instance registers during `init` (§6's
/// `malloc`/`malloc_atomic`/`malloc_uncollectable` are sugar over these).
pub const KIND_NORMAL: KindId = KindId(0);
pub const KIND_PTRFREE: KindId = KindId(1);
pub const KIND_UNCOLLECTABLE: KindId = KindId(2);

/// A disclaim procedure (§4.8): returning `true` ("nonzero") keeps the
/// object alive for one more cycle.
pub type DisclaimProc = Arc<dyn Fn(NonNull<u8>) -> bool + Send + Sync>;

/// Array of free-list heads, one per granule count, as returned by
/// [`new_free_list`] and installed into a kind by [`new_kind`].
pub type FreeListArray = Vec<AtomicPtr<u8>>;

pub fn new_free_list() -> FreeListArray {
    (0..=MAXOBJGRANULES).map(|_| AtomicPtr::new(std::ptr::null_mut())).collect()
}

pub(crate) struct Kind {
    pub in_use: bool,
    pub descr_template: Descr,
    /// "Relocate descriptor" flag (§3): whether `descr_template` must be
    /// adjusted by the object's runtime size (used for `PER_OBJECT`
    /// descriptors whose displacement is computed relative to a variable
    /// object length).
    pub relocate_descr: bool,
    pub init_on_free: bool,
    pub disclaim: Option<DisclaimProc>,
    pub mark_unconditionally: bool,
    pub freelist: FreeListArray,
    /// Per-granule-size reclaim-list heads: blocks of this kind and size
    /// queued for deferred sweep by `reclaim::continue_reclaim`.
    pub reclaim_list: Vec<Mutex<Option<NonNull<BlockHeader>>>>,
}

// SAFETY: `NonNull<BlockHeader>` entries in `reclaim_list` are only ever
// touched under the allocator lock, matching the rest of the header graph.
unsafe impl Send for Kind {}

impl Kind {
    fn new(descr_template: Descr, relocate_descr: bool, init_on_free: bool, freelist: FreeListArray) -> Self {
        Kind {
            in_use: true,
            descr_template,
            relocate_descr,
            init_on_free,
            disclaim: None,
            mark_unconditionally: false,
            freelist,
            reclaim_list: (0..=MAXOBJGRANULES).map(|_| Mutex::new(None)).collect(),
        }
    }
}

pub(crate) struct KindTable {
    kinds: Mutex<Vec<Kind>>,
}

impl KindTable {
    pub fn new() -> Self {
        let mut kinds = Vec::with_capacity(MAXOBJKINDS);
        // KIND_NORMAL: scanned, conservative whole-object descriptor
        // (relocated per-allocation to the actual requested size).
        kinds.push(Kind::new(Descr::length(0), true, false, new_free_list()));
        // KIND_PTRFREE: atomic, never scanned.
        kinds.push(Kind::new(Descr::length(0), false, false, new_free_list()));
        // KIND_UNCOLLECTABLE: scanned like NORMAL but never swept; see
        // `reclaim::start_reclaim` for how this kind is excluded from
        // reclaim, and `collector::push_mark_unconditionally_roots` for how
        // `mark_unconditionally` below keeps its referents alive every cycle.
        let mut uncollectable = Kind::new(Descr::length(0), true, false, new_free_list());
        uncollectable.mark_unconditionally = true;
        kinds.push(uncollectable);
        KindTable { kinds: Mutex::new(kinds) }
    }

    /// §6 `new_kind`. Registers a new kind, returning an id `<= MAXOBJKINDS
    /// - 1` or `GcError::OutOfMemory` if the table is full.
    pub fn new_kind(
        &self,
        freelist_template: FreeListArray,
        descr: Descr,
        adjust: bool,
        clear: bool,
    ) -> Result<KindId, GcError> {
        let mut kinds = self.kinds.lock();
        if kinds.len() >= MAXOBJKINDS {
            return Err(GcError::OutOfMemory);
        }
        let id = KindId(kinds.len() as u8);
        kinds.push(Kind::new(descr, adjust, clear, freelist_template));
        Ok(id)
    }

    pub fn register_disclaim_proc(
        &self,
        kind: KindId,
        proc: DisclaimProc,
        mark_unconditionally: bool,
    ) -> Result<(), GcError> {
        let mut kinds = self.kinds.lock();
        let k = kinds
            .get_mut(kind.index())
            .filter(|k| k.in_use)
            .ok_or(GcError::ConfigUnsupported("kind id out of range"))?;
        k.disclaim = Some(proc);
        k.mark_unconditionally = mark_unconditionally;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.kinds.lock().len()
    }

    pub fn with_kind<R>(&self, kind: KindId, f: impl FnOnce(&Kind) -> R) -> R {
        let kinds = self.kinds.lock();
        f(&kinds[kind.index()])
    }

    pub fn with_kind_mut<R>(&self, kind: KindId, f: impl FnOnce(&mut Kind) -> R) -> R {
        let mut kinds = self.kinds.lock();
        f(&mut kinds[kind.index()])
    }

    pub fn pop_freelist(&self, kind: KindId, granules: usize) -> Option<NonNull<u8>> {
        self.kinds.lock()[kind.index()].freelist.get(granules).and_then(|head| {
            let ptr = head.load(Ordering::Acquire);
            if ptr.is_null() {
                return None;
            }
            // The first word of a free object is the next-link (§4.3).
            let next = unsafe { *(ptr as *const *mut u8) };
            head.store(next, Ordering::Release);
            NonNull::new(ptr)
        })
    }

    pub fn push_freelist(&self, kind: KindId, granules: usize, obj: NonNull<u8>) {
        let kinds = self.kinds.lock();
        let head = &kinds[kind.index()].freelist[granules];
        let old = head.load(Ordering::Acquire);
        unsafe { *(obj.as_ptr() as *mut *mut u8) = old };
        head.store(obj.as_ptr(), Ordering::Release);
    }

    /// Snapshots every address currently sitting unallocated on `kind`'s free
    /// lists, across all granule buckets. Used by the `mark_unconditionally`
    /// root-push phase (§4.4.1 `PUSH_UNCOLLECTABLE`, generalized in
    /// `collector::push_mark_unconditionally_roots` to every kind with the
    /// flag set) to tell a genuinely in-use slot apart from one that merely
    /// looks occupied because it hasn't been handed out yet.
    pub fn free_addrs(&self, kind: KindId) -> std::collections::HashSet<usize> {
        let heads: Vec<*mut u8> = {
            let kinds = self.kinds.lock();
            kinds[kind.index()].freelist.iter().map(|h| h.load(Ordering::Acquire)).collect()
        };
        let mut set = std::collections::HashSet::new();
        for mut ptr in heads {
            while !ptr.is_null() {
                if !set.insert(ptr as usize) {
                    break; // defensive: a corrupt cyclic chain must not hang this scan.
                }
                ptr = unsafe { *(ptr as *const *mut u8) };
            }
        }
        set
    }
}

/// §4.3 `size_map`: translate a requested byte count into a granule index,
/// rounding up to one of a small ladder of canonical small sizes so that a
/// handful of free lists serve many nearby request sizes. Exact below 8
/// granules (where rounding waste would be proportionally large), coarser
/// above it. Any request translating to more than `MAXOBJGRANULES` falls
/// through to the large-object path (`allochblk` directly).
pub fn bytes_to_granules(bytes: usize) -> usize {
    let padded = bytes.max(1);
    let raw_granules = (padded + GRANULE_BYTES - 1) / GRANULE_BYTES;
    round_up_granules(raw_granules)
}

fn round_up_granules(g: usize) -> usize {
    if g <= 8 {
        g
    } else if g <= 32 {
        (g + 1) & !1
    } else {
        (g + 3) & !3
    }
}

pub fn granules_to_bytes(granules: usize) -> usize {
    granules * GRANULE_BYTES
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_map_is_monotonic_and_covers_request() {
        let mut prev = 0;
        for bytes in 1..4096 {
            let g = bytes_to_granules(bytes);
            assert!(granules_to_bytes(g) >= bytes);
            assert!(g >= prev);
            prev = g;
        }
    }

    #[test]
    fn size_map_exact_for_small_requests() {
        assert_eq!(bytes_to_granules(1), 1);
        assert_eq!(bytes_to_granules(GRANULE_BYTES), 1);
        assert_eq!(bytes_to_granules(GRANULE_BYTES + 1), 2);
    }

    #[test]
    fn new_kind_allocates_sequential_ids() {
        let table = KindTable::new();
        let k1 = table.new_kind(new_free_list(), Descr::length(16), false, false).unwrap();
        let k2 = table.new_kind(new_free_list(), Descr::length(32), false, false).unwrap();
        assert_ne!(k1, k2);
    }
}
