// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The collector singleton (§9 "single root module with explicit init
//! call"): wires every subsystem module together and exposes the §6 external
//! interface as free functions over one lazily-initialized global instance.

use crate::allochblk::{BlockAllocator, GetMem, MmapGetMem};
use crate::config::DEFAULT_PAGE_HASH_TABLE_SIZE;
use crate::dirty::{self, Vdb};
use crate::error::{AbortHook, GcError};
use crate::freelist::Allocator as FreeListAllocator;
use crate::hdrs::HeapIndex;
use crate::kinds::{
    DisclaimProc, FreeListArray, KindId, KindTable, KIND_NORMAL, KIND_PTRFREE, KIND_UNCOLLECTABLE,
};
use crate::mark::{Descr, MarkEngine, MarkState};
use crate::reclaim::Reclaimer;
use crate::roots::{self, PushOtherRoots, RootTable};
use parking_lot::Mutex;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

/// Host collaborator for stopping/restarting every other mutator thread
/// around a collection cycle (§5). The default is a no-op, correct only for
/// a single-threaded host; a multi-threaded host must supply a real
/// implementation at [`init`].
pub trait StopTheWorld: Send + Sync {
    fn stop_world(&self);
    fn start_world(&self);
}

pub(crate) struct NoStopTheWorld;

impl StopTheWorld for NoStopTheWorld {
    fn stop_world(&self) {}
    fn start_world(&self) {}
}

pub(crate) struct Collector {
    index: Arc<HeapIndex>,
    kinds: Arc<KindTable>,
    blocks: Arc<BlockAllocator>,
    alloc: FreeListAllocator,
    reclaim: Reclaimer,
    mark: Arc<MarkEngine>,
    roots: RootTable,
    vdb: Mutex<Option<Arc<dyn Vdb>>>,
    stop_the_world: Mutex<Arc<dyn StopTheWorld>>,
    in_cycle: AtomicBool,
}

impl Collector {
    fn new(get_mem: Arc<dyn GetMem>, stop_the_world: Arc<dyn StopTheWorld>) -> Self {
        let index = Arc::new(HeapIndex::new());
        let kinds = Arc::new(KindTable::new());
        let blocks = Arc::new(BlockAllocator::new(index.clone(), get_mem));
        let alloc = FreeListAllocator::new(index.clone(), kinds.clone(), blocks.clone());
        let reclaim = Reclaimer::new(index.clone(), kinds.clone(), blocks.clone());
        let mark = Arc::new(MarkEngine::new(DEFAULT_PAGE_HASH_TABLE_SIZE));
        mark.set_mark_stack_limit(crate::config::mark_stack_limit());
        Collector {
            index,
            kinds,
            blocks,
            alloc,
            reclaim,
            mark,
            roots: RootTable::new(),
            vdb: Mutex::new(None),
            stop_the_world: Mutex::new(stop_the_world),
            in_cycle: AtomicBool::new(false),
        }
    }
}

static GLOBAL: OnceLock<Collector> = OnceLock::new();

fn global() -> &'static Collector {
    GLOBAL.get_or_init(|| {
        crate::logger::try_init();
        Collector::new(Arc::new(MmapGetMem), Arc::new(NoStopTheWorld))
    })
}

/// Overrides the default collaborators before the collector singleton is
/// first touched by any other call. Returns `false` (and has no effect) if
/// the singleton was already initialized, matching `OnceLock`'s one-shot
/// semantics — this crate has no "re-init" story, the same as bdwgc's own
/// `GC_INIT` being a once-per-process call.
pub fn init(get_mem: Arc<dyn GetMem>, stop_the_world: Arc<dyn StopTheWorld>) -> bool {
    crate::logger::try_init();
    GLOBAL.set(Collector::new(get_mem, stop_the_world)).is_ok()
}

static ABORT_HOOK: OnceLock<Mutex<Arc<AbortHook>>> = OnceLock::new();

pub(crate) fn abort_hook() -> Arc<AbortHook> {
    ABORT_HOOK
        .get_or_init(|| Mutex::new(Arc::new(crate::error::default_abort_hook)))
        .lock()
        .clone()
}

/// Overrides the hook [`crate::error::abort`] invokes before terminating the
/// process.
pub fn set_abort_hook(hook: Arc<AbortHook>) {
    *ABORT_HOOK
        .get_or_init(|| Mutex::new(Arc::new(crate::error::default_abort_hook)))
        .lock() = hook;
}

fn maybe_collect_before_alloc(c: &Collector) {
    if c.blocks.should_collect_before_expand() {
        gcollect_inner(c);
    }
}

/// §6 `malloc`: a scanned, collectable allocation of kind `KIND_NORMAL`.
pub fn malloc(size: usize) -> Result<NonNull<u8>, GcError> {
    malloc_kind(size, KIND_NORMAL)
}

/// §6 `malloc_atomic`: a collectable allocation known to hold no pointers,
/// so the mark phase never scans its contents.
pub fn malloc_atomic(size: usize) -> Result<NonNull<u8>, GcError> {
    malloc_kind(size, KIND_PTRFREE)
}

/// §6 `malloc_uncollectable`: scanned like `malloc`, but its objects are
/// never swept (`KIND_UNCOLLECTABLE` is hardcoded out of reclaim in
/// `reclaim::start_reclaim`; [`gcollect_inner`]'s `push_mark_unconditionally_roots`
/// phase is what keeps whatever it points at alive every cycle).
pub fn malloc_uncollectable(size: usize) -> Result<NonNull<u8>, GcError> {
    malloc_kind(size, KIND_UNCOLLECTABLE)
}

/// §6 `malloc_kind`: the general entry point every other `malloc*` function
/// and [`disclaim::finalized_malloc`] is sugar over.
pub fn malloc_kind(size: usize, kind: KindId) -> Result<NonNull<u8>, GcError> {
    let c = global();
    maybe_collect_before_alloc(c);
    c.alloc.generic_malloc_inner(size, kind)
}

/// §6 `free`. Safety: `obj` must be a pointer previously returned by one of
/// the `malloc*`/`malloc_kind` functions above and not already freed.
pub unsafe fn free(obj: NonNull<u8>) {
    let c = global();
    let addr = obj.as_ptr() as usize;
    let Some(hdr_ptr) = c.index.find_header(addr) else {
        return;
    };
    let hdr = hdr_ptr.as_ref();
    if hdr.is_free() {
        return;
    }
    if hdr.is_large_block() {
        c.blocks.freehblk(hdr_ptr);
        return;
    }
    let granules = (hdr.sz / crate::config::GRANULE_BYTES).clamp(1, crate::config::MAXOBJGRANULES);
    c.kinds.push_freelist(hdr.kind, granules, obj);
}

/// §6 `new_kind`.
pub fn new_kind(freelist_template: FreeListArray, descr: Descr, adjust: bool, clear: bool) -> Result<KindId, GcError> {
    global().kinds.new_kind(freelist_template, descr, adjust, clear)
}

pub use crate::kinds::new_free_list;

/// §6 `register_disclaim_proc`.
pub fn register_disclaim_proc(kind: KindId, proc: DisclaimProc, mark_unconditionally: bool) -> Result<(), GcError> {
    global().kinds.register_disclaim_proc(kind, proc, mark_unconditionally)
}

pub use crate::disclaim::{finalized_malloc, init_finalized_malloc, FinalizerClosure};

/// §6 `register_displacement`.
pub fn register_displacement(offset: isize) -> Result<(), GcError> {
    global().mark.register_displacement(offset);
    Ok(())
}

/// §6 `enable_incremental`: probes available VDB strategies in priority
/// order and arms the first one the platform supports.
pub fn enable_incremental() -> Result<(), GcError> {
    enable_incremental_with(false)
}

/// Supplemental to §6: forces the manual VDB strategy rather than probing,
/// for hosts that want to call [`dirty`] themselves (`ManualVdb`) instead of
/// relying on `MPROTECT`/default auto-detection.
pub fn enable_incremental_manual() -> Result<(), GcError> {
    enable_incremental_with(true)
}

fn enable_incremental_with(prefer_manual: bool) -> Result<(), GcError> {
    let c = global();
    let vdb = dirty::select_strategy(prefer_manual)?;
    if vdb.name() == "default" && !prefer_manual {
        return Err(GcError::ConfigUnsupported("no incremental VDB strategy available on this platform"));
    }
    *c.vdb.lock() = Some(vdb);
    Ok(())
}

/// §4.6 `dirty(p)`: the manual-VDB entry point. A no-op unless
/// [`enable_incremental_manual`] selected [`crate::dirty::ManualVdb`].
pub fn dirty(p: usize) {
    let c = global();
    if let Some(vdb) = c.vdb.lock().as_ref() {
        vdb.mark_dirty(p);
    }
}

/// §6 `gcollect`: run a full cycle unconditionally, never abandoning a sweep
/// partway through.
pub fn gcollect() {
    gcollect_inner(global());
}

/// §6 `gcollect_maybe`: like [`gcollect`], but `stop_fn` is polled between
/// sweep steps; the sweep (and therefore the whole cycle) abandons early if
/// it ever returns `true`. Returns whether the cycle ran to completion.
pub fn gcollect_maybe(stop_fn: impl Fn() -> bool) -> bool {
    gcollect_maybe_inner(global(), &stop_fn)
}

/// §4.4.1 `PUSH_UNCOLLECTABLE` generalized to every kind registered with
/// the `mark_unconditionally` flag (§4.2, §4.8 `register_disclaim_proc`):
/// built-in `KIND_UNCOLLECTABLE` (marked unconditionally from construction,
/// see `KindTable::new`) plus any client kind registered with
/// `register_disclaim_proc(kind, proc, true)`, e.g. the finalized kind set
/// up by `disclaim::init_finalized_malloc`.
///
/// Every live slot of such a kind has its contents scanned every cycle via
/// `push_root`, not `push_contents_hdr`: this marks *from* the object (so
/// referents it points at survive the cycle, per `gc_priv.h`'s "mark from
/// all, including unmarked, objects in block") without forcing the
/// object's own mark bit. Leaving the object's own bit alone matters for
/// any kind besides `KIND_UNCOLLECTABLE` that reaches here: such kinds are
/// still swept normally, and `reclaim::sweep_small_block`/`sweep_large_block`
/// need to see them as unmarked when they truly are, so the disclaim
/// procedure still gets its per-object second chance before the slot is
/// freed. `KIND_UNCOLLECTABLE` needs no such allowance since it is excluded
/// from reclaim outright, regardless of its objects' mark bits.
fn push_mark_unconditionally_roots(c: &Collector) {
    for i in 0..c.kinds.len() {
        let kind = KindId(i as u8);
        if !c.kinds.with_kind(kind, |k| k.in_use && k.mark_unconditionally) {
            continue;
        }
        let free = c.kinds.free_addrs(kind);
        c.index.for_each_block(|block, hdr_ptr| {
            // SAFETY: called only while the collector holds exclusive access
            // to the heap during a cycle (mirrors every other header read
            // here).
            let hdr = unsafe { hdr_ptr.as_ref() };
            if hdr.kind != kind || hdr.is_free() {
                return;
            }
            if hdr.is_large_block() {
                if !free.contains(&block) {
                    c.mark.push_root(block, hdr.descr);
                }
                return;
            }
            let obj_bytes = hdr.sz;
            if obj_bytes == 0 {
                return;
            }
            let n_objs = crate::config::HBLKSIZE / obj_bytes;
            for i in 0..n_objs {
                let addr = block + i * obj_bytes;
                if !free.contains(&addr) {
                    c.mark.push_root(addr, hdr.descr);
                }
            }
        });
    }
}

fn run_mark_phase(c: &Collector, incremental: bool) {
    c.mark.set_state(MarkState::PushUncollectable);
    push_mark_unconditionally_roots(c);
    c.mark.set_state(MarkState::RootsPushed);
    roots::push_roots(&c.mark, &c.index, &c.roots);
    if incremental {
        // §4.6: every block the VDB reports possibly-dirty is scanned as an
        // extra root, since a write since the last cycle may have stored a
        // pointer the normal root set doesn't otherwise reach.
        let vdb = c.vdb.lock().clone();
        if let Some(vdb) = vdb {
            for block in vdb.read_dirty(&c.index) {
                if let Some(hdr_ptr) = c.index.find_header(block) {
                    let hdr = unsafe { hdr_ptr.as_ref() };
                    if hdr.is_free() {
                        continue;
                    }
                    let width = hdr.n_hblks() * crate::config::HBLKSIZE;
                    roots::scan_range(&c.mark, &c.index, block, block + width, false);
                }
            }
        }
    }
    let n_helpers = crate::config::parallel_markers().saturating_sub(1);
    if n_helpers > 0 {
        MarkEngine::mark_to_completion_parallel(&c.mark, &c.index, &c.kinds, n_helpers);
    } else {
        c.mark.mark_to_completion(&c.index, &c.kinds);
    }
}

/// §4.4/§4.7 full cycle, shared by [`gcollect`] and [`gcollect_maybe`].
/// `stop_fn` is polled only during the sweep; the mark phase always runs to
/// completion once started, since an object left only partially marked would
/// violate invariant I for every subsequent allocation.
fn gcollect_cycle(c: &Collector, stop_fn: &dyn Fn() -> bool) -> bool {
    if c.in_cycle.swap(true, Ordering::AcqRel) {
        // Re-entrant collection (e.g. a disclaim proc calling back into
        // malloc) is not supported; treat it as a no-op completed cycle
        // rather than corrupting the in-progress one.
        c.in_cycle.store(true, Ordering::Release);
        return true;
    }
    let heap_before = c.blocks.heap_size_bytes();
    if crate::config::print_stats() {
        log::info!("GC_PRINT_STATS: starting collection, heap size {} bytes", heap_before);
    }

    c.stop_the_world.lock().stop_world();
    crate::hdrs::CACHE_GENERATION.fetch_add(1, Ordering::Relaxed);
    c.index.clear_all_marks();
    c.mark.reset_for_cycle();

    let incremental = c.vdb.lock().is_some();
    run_mark_phase(c, incremental);

    c.reclaim.start_reclaim();
    let completed = c.reclaim.reclaim_all(stop_fn, true);
    c.blocks.reset_allocated_since_gc();
    if let Some(vdb) = c.vdb.lock().as_ref() {
        vdb.clear_dirty();
    }

    c.stop_the_world.lock().start_world();
    c.in_cycle.store(false, Ordering::Release);

    if crate::config::print_stats() || crate::config::dump_regularly() {
        log::info!(
            "GC_PRINT_STATS: collection {}, heap size now {} bytes",
            if completed { "completed" } else { "abandoned mid-sweep" },
            c.blocks.heap_size_bytes(),
        );
    }
    completed
}

fn gcollect_inner(c: &Collector) {
    gcollect_cycle(c, &|| false);
}

fn gcollect_maybe_inner(c: &Collector, stop_fn: &dyn Fn() -> bool) -> bool {
    gcollect_cycle(c, stop_fn)
}

/// §6 `set_push_other_roots`.
pub fn set_push_other_roots(f: Arc<dyn PushOtherRoots>) {
    global().roots.set_push_other_roots(f);
}

/// §6 `get_push_other_roots`.
pub fn get_push_other_roots() -> Option<Arc<dyn PushOtherRoots>> {
    global().roots.get_push_other_roots()
}

/// §6 `add_roots`.
pub fn add_roots(begin: usize, end: usize) -> Result<(), GcError> {
    global().roots.add_roots(begin, end)
}

/// §6 `remove_roots`.
pub fn remove_roots(begin: usize, end: usize) {
    global().roots.remove_roots(begin, end);
}

/// §6 `get_stack_base`.
pub fn get_stack_base() -> Option<(usize, usize)> {
    roots::current_stack_bounds()
}

/// Backs [`crate::gc::Inspect::is_live`]: whether the object starting
/// exactly at `addr` currently carries a mark bit. `addr` is assumed to be
/// an object start (as every `Gc<T>` pointer is), not an arbitrary interior
/// pointer.
pub(crate) fn object_is_marked(addr: usize) -> bool {
    let c = global();
    let Some(hdr_ptr) = c.index.find_header(addr) else {
        return false;
    };
    // SAFETY: same header-lifetime argument as every other read in this
    // module; nothing frees a header out from under a live `Gc<T>`.
    let hdr = unsafe { hdr_ptr.as_ref() };
    if hdr.is_free() {
        return false;
    }
    if hdr.is_large_block() {
        return hdr.marks[0] != 0;
    }
    let displ = addr - hdr.block;
    let granule = hdr.granule_of_displ(displ);
    hdr.marks.get(granule).copied().unwrap_or(0) != 0
}
