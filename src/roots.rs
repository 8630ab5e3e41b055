// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Root discovery (§4.5): the conservative stack-and-register scan, the
//! explicit static-root table, and the `PushOtherRoots` escape hatch for
//! hosts with roots this crate has no way to find on its own (thread-local
//! storage blocks, JIT-generated stack frames, etc).

use crate::error::GcError;
use crate::hdrs::HeapIndex;
use crate::mark::MarkEngine;
use parking_lot::Mutex;
use std::sync::Arc;

const WORD_SIZE: usize = std::mem::size_of::<usize>();

/// A host-supplied source of roots this crate cannot enumerate itself.
/// Registered once via [`RootTable::set_push_other_roots`]; invoked once per
/// cycle with a callback the implementation calls for each root range it
/// knows about (start address, exclusive end address).
pub trait PushOtherRoots: Send + Sync {
    fn push_other_roots(&self, push: &mut dyn FnMut(usize, usize));
}

/// Explicit static/global roots (§4.5 "static root table") plus the single
/// optional [`PushOtherRoots`] collaborator. Bounded rather than growable so
/// a runaway caller degrades to a logged, ignored `add_roots` rather than
/// unbounded memory growth (§7 "logged as warning and ignored").
const MAX_STATIC_ROOTS: usize = 4096;

pub(crate) struct RootTable {
    ranges: Mutex<Vec<(usize, usize)>>,
    other: Mutex<Option<Arc<dyn PushOtherRoots>>>,
}

impl RootTable {
    pub fn new() -> Self {
        RootTable {
            ranges: Mutex::new(Vec::new()),
            other: Mutex::new(None),
        }
    }

    /// §6 `add_roots`.
    pub fn add_roots(&self, lo: usize, hi: usize) -> Result<(), GcError> {
        let (lo, hi) = (lo.min(hi), lo.max(hi));
        let mut ranges = self.ranges.lock();
        if ranges.len() >= MAX_STATIC_ROOTS {
            log::warn!("static root table full; ignoring add_roots({:#x}, {:#x})", lo, hi);
            return Err(GcError::RootsOverflow);
        }
        ranges.push((lo, hi));
        Ok(())
    }

    /// §6 `exclude_static_roots` / `remove_roots`: carves `[lo, hi)` out of
    /// every previously registered range it overlaps, per
    /// `exclude_static_roots_inner`'s "carve a hole out of previously
    /// registered ranges". A range wholly inside `[lo, hi)` disappears; a
    /// range straddling one edge is trimmed; a range straddling both edges
    /// splits into the two remaining sub-ranges either side of the hole.
    pub fn remove_roots(&self, lo: usize, hi: usize) {
        let (lo, hi) = (lo.min(hi), lo.max(hi));
        let mut ranges = self.ranges.lock();
        let old = std::mem::take(&mut *ranges);
        for (a, b) in old {
            if b <= lo || a >= hi {
                // No overlap with the excluded interval.
                ranges.push((a, b));
                continue;
            }
            if a < lo {
                ranges.push((a, lo));
            }
            if b > hi {
                ranges.push((hi, b));
            }
        }
    }

    pub fn set_push_other_roots(&self, cb: Arc<dyn PushOtherRoots>) {
        *self.other.lock() = Some(cb);
    }

    /// §6 `get_push_other_roots`.
    pub fn get_push_other_roots(&self) -> Option<Arc<dyn PushOtherRoots>> {
        self.other.lock().clone()
    }

    fn for_each_static_range(&self, mut f: impl FnMut(usize, usize)) {
        for &(a, b) in self.ranges.lock().iter() {
            f(a, b);
        }
    }

    fn push_other(&self, mut f: impl FnMut(usize, usize)) {
        let other = self.other.lock().clone();
        if let Some(other) = other {
            other.push_other_roots(&mut f);
        }
    }
}

/// Scans `[lo, hi)` word-by-word, offering every word to the mark engine as
/// a candidate conservative pointer.
pub(crate) fn scan_range(engine: &MarkEngine, index: &HeapIndex, lo: usize, hi: usize, from_stack: bool) {
    let lo = lo & !(WORD_SIZE - 1);
    let mut addr = lo;
    while addr + WORD_SIZE <= hi {
        let word = unsafe { *(addr as *const usize) };
        engine.push_contents_hdr(word, index, false, from_stack);
        addr += WORD_SIZE;
    }
}

/// §4.5. Pushes every root this crate knows about: static ranges, the
/// `PushOtherRoots` collaborator, and the calling thread's stack and saved
/// registers.
pub fn push_roots(engine: &MarkEngine, index: &HeapIndex, roots: &RootTable) {
    roots.for_each_static_range(|lo, hi| scan_range(engine, index, lo, hi, false));
    roots.push_other(|lo, hi| scan_range(engine, index, lo, hi, false));
    stack_scan::scan_current_thread(engine, index);
}

#[cfg(target_os = "linux")]
unsafe fn get_stack_start() -> Option<usize> {
    let mut attr: libc::pthread_attr_t = std::mem::zeroed();
    if libc::pthread_attr_init(&mut attr) != 0 {
        return None;
    }
    let ptid = libc::pthread_self();
    let e = libc::pthread_getattr_np(ptid, &mut attr);
    if e != 0 {
        libc::pthread_attr_destroy(&mut attr);
        return None;
    }
    let mut stackaddr = std::ptr::null_mut();
    let mut stacksize = 0;
    let rc = libc::pthread_attr_getstack(&attr, &mut stackaddr, &mut stacksize);
    libc::pthread_attr_destroy(&mut attr);
    if rc != 0 {
        return None;
    }
    Some(stackaddr as usize + stacksize)
}

#[cfg(not(target_os = "linux"))]
unsafe fn get_stack_start() -> Option<usize> {
    None
}

/// §6 `get_stack_base`. Approximates the calling thread's stack bounds: the
/// upper bound comes from the platform stack-base query above, the lower
/// bound from the address of a local variable in this very frame (a stack
/// pointer snapshot would be tighter, but this is adequate for a
/// host-diagnostics query rather than a scan boundary).
pub(crate) fn current_stack_bounds() -> Option<(usize, usize)> {
    let sentinel: usize = 0;
    let approx_sp = &sentinel as *const usize as usize;
    let top = unsafe { get_stack_start() }?;
    Some((approx_sp.min(top), approx_sp.max(top)))
}

/// Register spilling is platform specific (§4.5 "conservative register
/// scan"): on the one target this crate knows how to spill registers for, a
/// hand-written assembly stub pushes callee- and caller-saved registers onto
/// the stack before handing control back, so the subsequent stack scan also
/// covers whatever a pointer-holding register had spilled there. Every other
/// target falls back to a stack-only scan, approximating the top of the
/// current frame with the address of a local variable; a reference held
/// purely in a register (never spilled to the stack by the compiler) is not
/// found on those targets.
#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
mod stack_scan {
    use super::*;

    type Address = usize;
    type StackScanCallback = extern "sysv64" fn(&ScanCtx, Address);

    #[link(name = "SpillRegisters", kind = "static")]
    extern "sysv64" {
        // The first argument is passed straight through to the callback as
        // its implicit receiver; only the calling convention need agree, not
        // the exact pointee type, hence `improper_ctypes` below.
        #[allow(improper_ctypes)]
        fn spill_registers(ctx: *mut u8, callback: StackScanCallback);
    }

    struct ScanCtx<'a> {
        engine: &'a MarkEngine,
        index: &'a HeapIndex,
    }

    extern "sysv64" fn scan_stack_cb(ctx: &ScanCtx, rsp: Address) {
        let top = unsafe { get_stack_start() }.unwrap_or(rsp);
        let (lo, hi) = if rsp <= top { (rsp, top) } else { (top, rsp) };
        scan_range(ctx.engine, ctx.index, lo, hi, true);
    }

    pub(crate) fn scan_current_thread(engine: &MarkEngine, index: &HeapIndex) {
        let ctx = ScanCtx { engine, index };
        unsafe { spill_registers(&ctx as *const ScanCtx as *mut u8, scan_stack_cb) };
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
mod stack_scan {
    use super::*;

    pub(crate) fn scan_current_thread(engine: &MarkEngine, index: &HeapIndex) {
        let sentinel: usize = 0;
        let approx_sp = &sentinel as *const usize as usize;
        let top = unsafe { get_stack_start() }.unwrap_or(approx_sp);
        let (lo, hi) = if approx_sp <= top { (approx_sp, top) } else { (top, approx_sp) };
        scan_range(engine, index, lo, hi, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_remove_roots_roundtrip() {
        let table = RootTable::new();
        table.add_roots(0x1000, 0x2000).unwrap();
        let mut seen = Vec::new();
        table.for_each_static_range(|a, b| seen.push((a, b)));
        assert_eq!(seen, vec![(0x1000, 0x2000)]);
        table.remove_roots(0x1000, 0x2000);
        seen.clear();
        table.for_each_static_range(|a, b| seen.push((a, b)));
        assert!(seen.is_empty());
    }

    #[test]
    fn remove_roots_splits_a_partially_overlapping_range() {
        let table = RootTable::new();
        table.add_roots(0x1000, 0x3000).unwrap();
        // Carve a hole out of the middle third.
        table.remove_roots(0x1800, 0x2800);
        let mut seen = Vec::new();
        table.for_each_static_range(|a, b| seen.push((a, b)));
        seen.sort();
        assert_eq!(seen, vec![(0x1000, 0x1800), (0x2800, 0x3000)]);
    }

    #[test]
    fn remove_roots_trims_one_edge() {
        let table = RootTable::new();
        table.add_roots(0x1000, 0x2000).unwrap();
        table.remove_roots(0x1800, 0x2800);
        let mut seen = Vec::new();
        table.for_each_static_range(|a, b| seen.push((a, b)));
        assert_eq!(seen, vec![(0x1000, 0x1800)]);
    }

    #[test]
    fn remove_roots_drops_a_range_wholly_inside_the_hole() {
        let table = RootTable::new();
        table.add_roots(0x1800, 0x2000).unwrap();
        table.remove_roots(0x1000, 0x3000);
        let mut seen = Vec::new();
        table.for_each_static_range(|a, b| seen.push((a, b)));
        assert!(seen.is_empty());
    }

    #[test]
    fn remove_roots_ignores_disjoint_ranges() {
        let table = RootTable::new();
        table.add_roots(0x1000, 0x2000).unwrap();
        table.remove_roots(0x3000, 0x4000);
        let mut seen = Vec::new();
        table.for_each_static_range(|a, b| seen.push((a, b)));
        assert_eq!(seen, vec![(0x1000, 0x2000)]);
    }

    #[test]
    fn add_roots_overflow_is_reported_not_fatal() {
        let table = RootTable::new();
        for i in 0..MAX_STATIC_ROOTS {
            table.add_roots(i, i + 1).unwrap();
        }
        assert!(matches!(table.add_roots(1, 2), Err(GcError::RootsOverflow)));
    }
}
