// Run-time:
//   status: success

// Allocates 100 finalized objects whose closures increment a shared counter
// and record the data pointer they were handed, drops the only references
// to them, and collects twice (finalizers may lag a cycle behind
// unreachability). Expects the counter to reach 100 and every recorded data
// pointer to match one of the original allocations exactly once (§8
// scenario 2).

extern crate gcrt;

use gcrt::{finalized_malloc, gcollect, init_finalized_malloc, FinalizerClosure};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const N: usize = 100;

fn main() {
    init_finalized_malloc();

    let counter = Arc::new(AtomicUsize::new(0));
    let seen: Arc<Mutex<HashSet<usize>>> = Arc::new(Mutex::new(HashSet::new()));

    let mut objs = Vec::with_capacity(N);
    for _ in 0..N {
        let c = counter.clone();
        let s = seen.clone();
        let closure = FinalizerClosure::new(Arc::new(move |data: std::ptr::NonNull<u8>| {
            c.fetch_add(1, Ordering::SeqCst);
            s.lock().unwrap().insert(data.as_ptr() as usize);
        }));
        let obj = finalized_malloc(8, closure).expect("finalized_malloc");
        objs.push(obj.as_ptr() as usize);
    }

    let expected: HashSet<usize> = objs.iter().copied().collect();

    // Drop the only references to the finalized objects.
    objs.clear();

    gcollect();
    gcollect();

    assert_eq!(counter.load(Ordering::SeqCst), N);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), N);
    assert_eq!(*seen, expected);
}
