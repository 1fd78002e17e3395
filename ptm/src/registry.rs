// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Process-wide registry that hands out dense thread ids in
//! `[0, MAX_THREADS)`. The first call to [`get_tid`] on a thread claims the
//! lowest free slot; a thread-local checkout handle releases the slot again
//! when the thread terminates, so ids get recycled.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::cell::Cell;

/// Maximum number of threads that can run transactions concurrently.
pub const MAX_THREADS: usize = 128;

struct Registry {
    used: [AtomicBool; MAX_THREADS],
    // Highest tid handed out so far, plus one. Not tight: slots below the
    // watermark may have been released already.
    max_tid: AtomicUsize,
}

#[allow(clippy::declare_interior_mutable_const)]
const UNUSED: AtomicBool = AtomicBool::new(false);

static REGISTRY: Registry = Registry {
    used: [UNUSED; MAX_THREADS],
    max_tid: AtomicUsize::new(0),
};

// Progress condition: wait-free bounded (by the number of slots)
fn register_thread_new() -> usize {
    for tid in 0..MAX_THREADS {
        if REGISTRY.used[tid].load(Ordering::Acquire) {
            continue;
        }
        if REGISTRY.used[tid]
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            continue;
        }
        // Raise the watermark to cover our id
        let mut cur = REGISTRY.max_tid.load(Ordering::Acquire);
        while cur <= tid {
            match REGISTRY
                .max_tid
                .compare_exchange(cur, tid + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(seen) => cur = seen,
            }
        }
        return tid;
    }
    log::error!("too many threads, the registry can only hold {}", MAX_THREADS);
    panic!("thread registry can only hold {} threads", MAX_THREADS);
}

/// Releases a slot. Called by the thread-local checkout on thread exit, but
/// also usable directly by tests that fake thread identities.
///
/// Progress condition: wait-free population oblivious
pub fn deregister(tid: usize) {
    REGISTRY.used[tid].store(false, Ordering::Release);
}

/// Upper bound on the ids currently in use (highest assigned id + 1).
///
/// Progress condition: wait-free population oblivious
pub fn max_threads() -> usize {
    REGISTRY.max_tid.load(Ordering::Acquire)
}

struct Checkout {
    tid: Cell<Option<usize>>,
}

impl Drop for Checkout {
    fn drop(&mut self) {
        if let Some(tid) = self.tid.get() {
            deregister(tid);
        }
    }
}

thread_local! {
    static CHECKOUT: Checkout = Checkout { tid: Cell::new(None) };
}

/// Returns the calling thread's id, assigning one on first use.
///
/// Progress condition: wait-free bounded (by the number of slots)
pub fn get_tid() -> usize {
    CHECKOUT.with(|c| match c.tid.get() {
        Some(tid) => tid,
        None => {
            let tid = register_thread_new();
            c.tid.set(Some(tid));
            tid
        }
    })
}
