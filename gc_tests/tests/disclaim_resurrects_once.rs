// Run-time:
//   status: success

// Registers a disclaim procedure that returns nonzero (resurrect) the first
// time it is asked about a given object and zero (reclaim) every time after.
// Ten objects are allocated, the only root reaching them is dropped, and two
// collections run back to back: the first must resurrect all ten, the
// second must reclaim all ten (§8 scenario 4).

extern crate gcrt;

use gcrt::{gcollect, malloc_kind, new_free_list, new_kind, register_disclaim_proc, Descr};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const N: usize = 10;

fn main() {
    let kind = new_kind(new_free_list(), Descr::length(0), false, false).expect("new_kind");

    let calls: Arc<Mutex<HashMap<usize, usize>>> = Arc::new(Mutex::new(HashMap::new()));
    let calls_proc = calls.clone();
    register_disclaim_proc(
        kind,
        Arc::new(move |obj| {
            let addr = obj.as_ptr() as usize;
            let mut calls = calls_proc.lock().unwrap();
            let count = calls.entry(addr).or_insert(0);
            *count += 1;
            *count == 1
        }),
        false,
    )
    .expect("register_disclaim_proc");

    let mut objs = Vec::with_capacity(N);
    for _ in 0..N {
        objs.push(malloc_kind(16, kind).expect("malloc_kind").as_ptr() as usize);
    }
    // The only root reaching these objects was this local Vec of raw
    // pointers; clearing it leaves them unreachable from the stack.
    objs.clear();

    gcollect();
    {
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), N);
        assert!(calls.values().all(|&c| c == 1));
    }

    gcollect();
    {
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), N);
        assert!(calls.values().all(|&c| c == 2));
    }
}
