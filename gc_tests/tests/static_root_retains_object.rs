// Run-time:
//   status: success

// Registers an out-of-heap static variable as a root range, stores a single
// pointer to a heap object in it, and drops every other reference. The
// object is reachable only through that explicit root, not the stack or
// registers, so a collection must retain it (§8 scenario 6).

extern crate gcrt;

use gcrt::{add_roots, gcollect, malloc_kind, new_free_list, new_kind, register_disclaim_proc, Descr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

static mut STATIC_ROOT: usize = 0;

fn main() {
    let kind = new_kind(new_free_list(), Descr::length(0), false, false).expect("new_kind");

    let reclaimed = Arc::new(AtomicBool::new(false));
    let flag = reclaimed.clone();
    register_disclaim_proc(
        kind,
        Arc::new(move |_obj| {
            flag.store(true, Ordering::SeqCst);
            false
        }),
        false,
    )
    .expect("register_disclaim_proc");

    unsafe {
        let obj = malloc_kind(8, kind).expect("malloc_kind");
        STATIC_ROOT = obj.as_ptr() as usize;

        let base = std::ptr::addr_of!(STATIC_ROOT) as usize;
        add_roots(base, base + std::mem::size_of::<usize>()).expect("add_roots");
    }
    // `obj` itself has already gone out of scope; STATIC_ROOT is the only
    // remaining path to the allocation, and it lives outside the stack.

    gcollect();

    assert!(
        !reclaimed.load(Ordering::SeqCst),
        "object reachable only via an explicit static root was incorrectly reclaimed"
    );
}
