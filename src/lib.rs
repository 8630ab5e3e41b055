// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! `gcrt`: a conservative, mostly-precise, mark-sweep garbage collector
//! core, linkable into a host process as a drop-in allocator replacement.
//!
//! The collector is a lazily-initialized process-wide singleton (see
//! [`collector`]); every allocation, collection, and root-management entry
//! point is a free function in that module. [`gc::Gc`] layers a safe,
//! ergonomic smart pointer on top for callers who don't need the raw
//! `malloc`-family API directly.
//!
//! Call [`collector::init`] before the first allocation if the host needs to
//! override memory acquisition or stop-the-world; otherwise the defaults
//! (anonymous `mmap`, single-threaded no-op stop-the-world) are used
//! transparently on first use.

mod allochblk;
mod config;
mod disclaim;
mod dirty;
mod error;
mod freelist;
mod gc;
mod hdrs;
mod kinds;
mod logger;
mod mark;
mod pagehash;
mod reclaim;
mod roots;

mod collector;

pub use crate::allochblk::GetMem;
pub use crate::collector::{
    add_roots, dirty, enable_incremental, enable_incremental_manual, free, gcollect,
    gcollect_maybe, get_push_other_roots, get_stack_base, init, malloc, malloc_atomic,
    malloc_kind, malloc_uncollectable, new_kind, register_disclaim_proc, register_displacement,
    remove_roots, set_abort_hook, set_push_other_roots, StopTheWorld,
};
pub use crate::disclaim::{finalized_malloc, init_finalized_malloc, FinalizerClosure, FinalizerProc};
pub use crate::error::{AbortHook, GcError};
pub use crate::gc::{Gc, Inspect};
pub use crate::kinds::{new_free_list, DisclaimProc, FreeListArray, KindId, KIND_NORMAL, KIND_PTRFREE, KIND_UNCOLLECTABLE};
pub use crate::mark::Descr;
pub use crate::roots::PushOtherRoots;
