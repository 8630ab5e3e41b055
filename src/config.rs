// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Compile-time tunables and environment-variable-seeded runtime tunables.
//!
//! Every tunable constant and knob lives here so the rest of the crate
//! never hard-codes a magic number twice.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

/// Size, in bytes, of the unit of memory acquisition from the OS. Must be a
/// power of two; every block is aligned to this.
pub const HBLKSIZE: usize = 4096;
pub const LOG_HBLKSIZE: usize = 12;
static_assertions::const_assert_eq!(1usize << LOG_HBLKSIZE, HBLKSIZE);

/// Minimum allocation alignment unit: two pointer widths.
pub const GRANULE_BYTES: usize = 2 * std::mem::size_of::<usize>();

/// Largest displacement a forwarding header may encode (`HBLKSIZE - 1`).
pub const MAX_JUMP: usize = HBLKSIZE - 1;

/// Bits of address used to index the bottom-level table of the heap index.
pub const LOG_BOTTOM_SZ: usize = 10;
pub const BOTTOM_SZ: usize = 1 << LOG_BOTTOM_SZ;

/// Fixed capacity of the object-kind table.
pub const MAXOBJKINDS: usize = 32;

/// Largest granule count a small object's free list is indexed by; one more
/// than this and allocation falls through to the large-object path.
pub const MAXOBJGRANULES: usize = 256;
pub const MAXOBJBYTES: usize = MAXOBJGRANULES * GRANULE_BYTES;

/// Approximate number of bytes a `PROC`-tag mark descriptor may push per
/// invocation before it must re-push itself and return (§4.4.2).
pub const PROC_BYTES: usize = 100;

/// Entries discarded from the mark stack on overflow before transitioning
/// mark state (§4.4.4).
pub const GC_MARK_STACK_DISCARDS: usize = 16;

/// Default capacity, in entries, of the mark stack before overflow handling
/// kicks in. Grown rather than fixed in bdwgc; fixed here for simplicity,
/// sized generously enough that ordinary object graphs never hit it.
pub const DEFAULT_MARK_STACK_LIMIT: usize = 1 << 16;

/// Approximate number of bytes `mark_from` scans per call before yielding
/// back to the caller, so a single call never holds the mark lock or a CPU
/// for an unbounded stretch.
pub const MARK_WORK_QUANTUM_BYTES: usize = HBLKSIZE;

/// Bits of a mark descriptor reserved for the `PROC` tag's procedure index.
pub const LOG_MAX_MARK_PROCS: usize = 6;
pub const MAX_MARK_PROCS: usize = 1 << LOG_MAX_MARK_PROCS;

/// Default number of pages the block allocator's page-hash tables (dirty
/// sets and black lists) are sized for; grown geometrically if undersized.
pub const DEFAULT_PAGE_HASH_TABLE_SIZE: usize = 1 << 16;

/// Byte allocated-since-last-gc threshold that triggers `collect_or_expand`
/// to favor collection over expansion, expressed as a fraction (numerator
/// over 100) of current heap size. Matches the "free space divisor" idea
/// bdwgc tunes via `GC_free_space_divisor`.
pub const DEFAULT_ALLOC_THRESHOLD_PERCENT: usize = 50;

fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|v| v != "0" && !v.is_empty()).unwrap_or(false)
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Diagnostics toggle for `GC_PRINT_STATS`.
pub fn print_stats() -> bool {
    static FLAG: OnceLock<bool> = OnceLock::new();
    *FLAG.get_or_init(|| env_flag("GC_PRINT_STATS"))
}

/// Diagnostics toggle for `GC_DUMP_REGULARLY`.
pub fn dump_regularly() -> bool {
    static FLAG: OnceLock<bool> = OnceLock::new();
    *FLAG.get_or_init(|| env_flag("GC_DUMP_REGULARLY"))
}

/// `GC_USE_GETWRITEWATCH`: on platforms offering both GWW and MPROTECT VDBs,
/// force (1) or forbid (0) GWW. Unset means "prefer GWW if available". This
/// crate implements only the MPROTECT and Manual strategies (see
/// `dirty::Strategy`), so the flag is retained for interface completeness
/// and consulted by `Vdb::probe` but never yields a GWW selection.
pub fn use_getwritewatch() -> Option<bool> {
    match std::env::var("GC_USE_GETWRITEWATCH") {
        Ok(v) if v == "1" => Some(true),
        Ok(v) if v == "0" => Some(false),
        _ => None,
    }
}

/// `GC_LARGE_ALLOC_WARN_INTERVAL`: log a warning every Nth large-object
/// allocation above `MAXOBJBYTES`. Zero disables the warning.
pub fn large_alloc_warn_interval() -> usize {
    static VAL: OnceLock<usize> = OnceLock::new();
    *VAL.get_or_init(|| env_usize("GC_LARGE_ALLOC_WARN_INTERVAL", 5))
}

/// `GC_PARALLEL_MARKERS`: number of helper threads for parallel marking
/// (§4.4.6). Defaults to the host's CPU count, following the same default
/// `mmtk-mmtk-core` uses `num_cpus` for.
pub fn parallel_markers() -> usize {
    static VAL: OnceLock<usize> = OnceLock::new();
    *VAL.get_or_init(|| env_usize("GC_PARALLEL_MARKERS", num_cpus::get()))
}

/// `GC_MARK_STACK_LIMIT`: overrides [`DEFAULT_MARK_STACK_LIMIT`]. Mainly
/// useful for tests that need to force §4.4.4 overflow recovery without
/// building an object graph large enough to hit the default limit naturally.
pub fn mark_stack_limit() -> usize {
    static VAL: OnceLock<usize> = OnceLock::new();
    *VAL.get_or_init(|| env_usize("GC_MARK_STACK_LIMIT", DEFAULT_MARK_STACK_LIMIT))
}

/// Running count of large allocations, used by `large_alloc_warn_interval`.
pub(crate) static LARGE_ALLOC_COUNT: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn note_large_alloc() -> usize {
    LARGE_ALLOC_COUNT.fetch_add(1, Ordering::Relaxed) + 1
}
