// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A safe smart-pointer convenience layer over the raw `malloc`-family API
//! (§6A). `Gc<T>` is sugar for a kind-0, conservatively-scanned allocation:
//! it carries no bookkeeping of its own, so it is exactly as cheap (and
//! exactly as conservative) as calling `collector::malloc` directly and
//! writing `T` into the result.

use crate::collector;
use crate::mark::Descr;
use std::fmt;
use std::ops::Deref;
use std::ptr::NonNull;

/// A garbage-collected pointer to a `T` allocated on the conservatively
/// scanned heap. `Copy` because the collector, not reference counting or
/// ownership, is what keeps the pointee alive; cloning a `Gc<T>` is exactly
/// as cheap as copying a raw pointer.
pub struct Gc<T> {
    ptr: NonNull<T>,
}

impl<T> Clone for Gc<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Gc<T> {}

impl<T> Gc<T> {
    /// Allocates a `T`-sized, `T`-aligned object on the managed heap and
    /// moves `value` into it. The object is scanned conservatively
    /// word-by-word (`Descr::length`), exactly like any other `malloc_kind`
    /// allocation with no custom descriptor: a "whole object, conservative"
    /// choice rather than deriving a precise bitmap from `T`'s layout.
    pub fn new(value: T) -> Self {
        let size = std::mem::size_of::<T>().max(1);
        let descr = Descr::length(size);
        let kind = gc_kind(descr);
        let obj = collector::malloc_kind(size, kind)
            .unwrap_or_else(|e| crate::error::abort(&format!("Gc::new allocation failed: {}", e)));
        let ptr = obj.cast::<T>();
        unsafe { ptr.as_ptr().write(value) };
        Gc { ptr }
    }

    pub fn as_ptr(self) -> *const T {
        self.ptr.as_ptr()
    }

    /// Reconstructs a `Gc<T>` from a raw pointer previously obtained from
    /// [`Gc::as_ptr`] (or from a conservative scan turning up the same
    /// address). The caller vouches that `ptr` still points at a live `T`
    /// allocated by [`Gc::new`].
    pub unsafe fn from_raw(ptr: *const T) -> Self {
        Gc {
            ptr: NonNull::new_unchecked(ptr as *mut T),
        }
    }
}

impl<T> Deref for Gc<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: fmt::Debug> fmt::Debug for Gc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

// SAFETY: a `Gc<T>` is just an address into heap memory the collector keeps
// alive; sending it across threads is sound whenever `T` itself would be,
// same as any other `T`-holding smart pointer.
unsafe impl<T: Send> Send for Gc<T> {}
unsafe impl<T: Sync> Sync for Gc<T> {}

/// Every `Gc<T>` allocation shares one kind regardless of `T`, since its
/// descriptor is always "scan the whole object conservatively" — there is no
/// per-`T` free list or mark procedure to register.
fn gc_kind(descr: Descr) -> crate::kinds::KindId {
    use std::sync::OnceLock;
    static KIND: OnceLock<crate::kinds::KindId> = OnceLock::new();
    *KIND.get_or_init(|| {
        collector::new_kind(collector::new_free_list(), descr, true, false)
            .unwrap_or_else(|e| crate::error::abort(&format!("Gc kind registration failed: {}", e)))
    })
}

/// Inspection shim used by this crate's own integration tests: whether the
/// object a `Gc<T>` points at was marked live by the most recently
/// completed collection cycle.
pub struct Inspect;

impl Inspect {
    /// `true` if `gc`'s pointee carries a mark bit set by the most recently
    /// completed collection cycle. Before any cycle has run, every object's
    /// mark bit is unset, so this returns `false` even though the object is
    /// of course still live — callers only care about this after a
    /// `gcollect()`.
    pub fn is_live<T>(gc: Gc<T>) -> bool {
        crate::collector::object_is_marked(gc.as_ptr() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_and_deref_round_trip_a_value() {
        let g = Gc::new(42u64);
        assert_eq!(*g, 42);
    }

    #[test]
    fn clone_is_a_cheap_pointer_copy() {
        let g = Gc::new(String::from("hello"));
        let g2 = g;
        assert_eq!(g.as_ptr(), g2.as_ptr());
    }

    #[test]
    fn from_raw_recovers_the_same_pointee() {
        let g = Gc::new((1u64, 2u64));
        let raw = g.as_ptr();
        let g2 = unsafe { Gc::from_raw(raw) };
        assert_eq!(*g2, (1, 2));
    }
}
