// Run-time:
//   status: success

// Builds a 1024-node singly-linked list out of `malloc_kind` cells, drops
// the only root that reaches it, and collects once. A disclaim procedure on
// the cell kind counts every reclamation; exactly 1024 are expected (§8
// scenario 1).

extern crate gcrt;

use gcrt::{gcollect, malloc_kind, new_free_list, new_kind, register_disclaim_proc, Descr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const N: usize = 1024;

fn main() {
    let kind = new_kind(new_free_list(), Descr::length(std::mem::size_of::<usize>()), false, false)
        .expect("new_kind");

    let reclaimed = Arc::new(AtomicUsize::new(0));
    let counter = reclaimed.clone();
    register_disclaim_proc(
        kind,
        Arc::new(move |_obj| {
            counter.fetch_add(1, Ordering::SeqCst);
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

    // Drop the head: overwriting the only local that reached the list
    // leaves every cell unreachable from the stack.
    head = std::ptr::null_mut();
    let _ = head;

    gcollect();

    assert_eq!(reclaimed.load(Ordering::SeqCst), N);
}
