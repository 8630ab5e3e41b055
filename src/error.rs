// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Error taxonomy (§7). Recoverable conditions are `GcError` values;
//! everything else is fatal and goes through [`abort`].

use std::fmt;

/// Recoverable error conditions surfaced to callers of the allocation API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcError {
    /// `get_mem` returned `None` after collection and expansion were both
    /// attempted.
    OutOfMemory,
    /// `enable_incremental` (or a VDB probe) found no workable strategy on
    /// this platform.
    ConfigUnsupported(&'static str),
    /// The static-root table is full; the request was ignored rather than
    /// corrupting existing state (§7: "logged as warning and ignored").
    RootsOverflow,
}

impl fmt::Display for GcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GcError::OutOfMemory => write!(f, "out of memory"),
            GcError::ConfigUnsupported(what) => write!(f, "unsupported configuration: {}", what),
            GcError::RootsOverflow => write!(f, "static root table is full"),
        }
    }
}

impl std::error::Error for GcError {}

/// Hook invoked by [`abort`] before the process is terminated. Hosts may
/// override this via [`crate::collector::set_abort_hook`] to, for example,
/// flush logs to a different sink before dying. The default logs at `error`
/// and calls [`std::process::abort`].
pub type AbortHook = dyn Fn(&str) + Send + Sync;

pub(crate) fn default_abort_hook(msg: &str) {
    log::error!("fatal collector error: {}", msg);
    std::process::abort();
}

/// Fatal path for `INVARIANT_VIOLATION` and `CLIENT_MISUSE` (§7). Never
/// returns.
#[cold]
pub fn abort(msg: &str) -> ! {
    (crate::collector::abort_hook())(msg);
    // The hook is expected to terminate the process; if a caller installed
    // one that doesn't, make sure we still never return into a broken heap.
    std::process::abort();
}
