// Run-time:
//   status: success

// Forces a tiny `GC_MARK_STACK_LIMIT` and then builds a 20,000-node linked
// list, deep enough that a single push-per-node traversal overflows that
// stack many times over. A disclaim procedure on the cell kind would only
// run on a node the mark phase failed to re-mark, so its never firing is
// the observable proof that overflow recovery (rescan from `scan_ptr`, per
// §4.4) finished the job rather than losing reachable nodes (§8 scenario 5).

extern crate gcrt;

use gcrt::{gcollect, malloc_kind, new_free_list, new_kind, register_disclaim_proc, Descr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const N: usize = 20_000;

fn main() {
    // Must be set before the first allocation triggers lazy collector init,
    // since the configured limit is read once and cached.
    std::env::set_var("GC_MARK_STACK_LIMIT", "64");

    let kind = new_kind(new_free_list(), Descr::length(std::mem::size_of::<usize>()), false, false)
        .expect("new_kind");

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

    let mut head: *mut u8 = std::ptr::null_mut();
    for _ in 0..N {
        let cell = malloc_kind(std::mem::size_of::<usize>(), kind).expect("malloc_kind");
        unsafe { *(cell.as_ptr() as *mut *mut u8) = head };
        head = cell.as_ptr();
    }

    gcollect();

    assert!(
        !reclaimed.load(Ordering::SeqCst),
        "a reachable list node was reclaimed after mark-stack overflow recovery"
    );

    // Keep `head` alive across the assertion so the whole chain stays a
    // live root until the check above has run.
    let _ = head;
}
