// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Finalization (§4.8), built as an ordinary client of `register_disclaim_proc`
//! plus one dedicated kind, exactly as bdwgc's own `fnlz_mlc.c`/`disclaim.c`
//! layer finalization on top of the lower-level disclaim mechanism.
//!
//! A finalized object's first word holds a tagged pointer to its
//! [`FinalizerClosure`]: the low bit set means "live, not yet finalized"; a
//! cleared low bit (or, for a slot that was never allocated at all, a plain
//! even free-list link or null) means "nothing to finalize here". This
//! mirrors `GC_finalized_disclaim`'s `(word)fc & 1` check precisely, which is
//! what lets the same disclaim callback run safely over every unmarked slot
//! in a block — including ones that are just free-list fragments, never
//! handed to a caller at all.

use crate::collector;
use crate::error::GcError;
use crate::kinds::{new_free_list, KindId};
use crate::mark::Descr;
use std::ptr::NonNull;
use std::sync::{Arc, OnceLock};

/// Called with a pointer to a finalized object's user-visible data (one word
/// past the tag), once the object becomes unreachable and is about to be
/// swept.
pub type FinalizerProc = Arc<dyn Fn(NonNull<u8>) + Send + Sync>;

/// §6 `finalized_malloc`'s closure argument. Bundles the finalizer itself;
/// bdwgc's `GC_finalizer_closure` additionally carries an opaque `cd` word,
/// folded away here since a Rust closure already captures whatever
/// environment it needs.
#[derive(Clone)]
pub struct FinalizerClosure {
    proc: FinalizerProc,
}

impl FinalizerClosure {
    pub fn new(proc: FinalizerProc) -> Self {
        FinalizerClosure { proc }
    }
}

const WORD: usize = std::mem::size_of::<usize>();

static FINALIZED_KIND: OnceLock<KindId> = OnceLock::new();

/// §6 `init_finalized_malloc`. Idempotent and safe to call more than once;
/// only the first call registers the kind, its disclaim proc, and the
/// displacement finalized objects are referenced at.
pub fn init_finalized_malloc() {
    FINALIZED_KIND.get_or_init(|| {
        let kind = collector::new_kind(new_free_list(), Descr::length(0), true, false)
            .expect("the finalized kind is the first custom kind registered; MAXOBJKINDS cannot already be exhausted");
        collector::register_disclaim_proc(kind, Arc::new(finalized_disclaim), true)
            .expect("registering a disclaim proc on a kind just created cannot fail");
        // Clients hold pointers to `obj + WORD` (§4.8), never to `obj`
        // itself; without this, every conservative reference to a finalized
        // object's data would be black-listed as a misaligned interior
        // pointer by `push_contents_hdr` (§4.4.3).
        let _ = collector::register_displacement(WORD as isize);
        kind
    });
}

/// §4.8, grounded on `GC_finalized_disclaim`. Interprets the tag bit; always
/// returns `false` (finalization runs at most once and never by itself keeps
/// an object alive past the cycle that finalizes it).
fn finalized_disclaim(obj: NonNull<u8>) -> bool {
    let tagged = unsafe { *(obj.as_ptr() as *const usize) };
    if tagged & 1 == 0 {
        return false;
    }
    let raw = (tagged & !1usize) as *mut FinalizerClosure;
    // SAFETY: only ever written by `finalized_malloc`, as a `Box` leaked with
    // its address OR'd with 1; this is the one place that address is
    // reclaimed, exactly once, since the tag bit guarantees disclaim
    // classifies the slot as free from here on regardless of how it's
    // re-threaded.
    let closure = unsafe { Box::from_raw(raw) };
    let data = unsafe { NonNull::new_unchecked((obj.as_ptr() as usize + WORD) as *mut u8) };
    (closure.proc)(data);
    false
}

/// §6 `finalized_malloc`. Returns a pointer to `size` bytes of user data,
/// one word past the object's real start. Panics if
/// [`init_finalized_malloc`] has not run yet, matching bdwgc's `ABORT` on the
/// same precondition.
pub fn finalized_malloc(size: usize, closure: FinalizerClosure) -> Result<NonNull<u8>, GcError> {
    let kind = *FINALIZED_KIND
        .get()
        .expect("init_finalized_malloc must be called before finalized_malloc");
    let total = size.checked_add(WORD).ok_or(GcError::OutOfMemory)?;
    let obj = collector::malloc_kind(total, kind)?;
    let boxed = Box::into_raw(Box::new(closure));
    let tagged = (boxed as usize) | 1;
    unsafe { *(obj.as_ptr() as *mut usize) = tagged };
    let data = unsafe { NonNull::new_unchecked((obj.as_ptr() as usize + WORD) as *mut u8) };
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // These exercise only the tag-bit encode/decode contract in isolation;
    // the full allocate-mark-sweep-finalize path is covered by the gc_tests
    // integration scenario, since it needs a live collector singleton.
    #[test]
    fn disclaim_ignores_an_untagged_free_list_fragment() {
        let mut slot: usize = 0x1000; // even: looks like a plain next-link.
        let ptr = NonNull::new(&mut slot as *mut usize as *mut u8).unwrap();
        assert!(!finalized_disclaim(ptr));
    }

    #[test]
    fn disclaim_runs_the_closure_exactly_once_for_a_tagged_slot() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let closure = Box::new(FinalizerClosure::new(Arc::new(move |_data| {
            c.fetch_add(1, Ordering::Relaxed);
        })));
        let tagged = (Box::into_raw(closure) as usize) | 1;
        let mut storage = [tagged, 0usize];
        let ptr = NonNull::new(storage.as_mut_ptr() as *mut u8).unwrap();
        assert!(!finalized_disclaim(ptr));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }
}
