// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Hazard eras, specialized for reclaiming the announced transaction
//! closures of the wait-free engine. The global era is the sequence
//! component of the engine's transaction identifier; a retired object
//! carries the era window `[new_era, del_era]` in which it was reachable
//! and is deletable only once no thread publishes an era inside it.

use crate::pad::CacheAligned;
use crate::registry::{self, MAX_THREADS};
use core::sync::atomic::{AtomicU64, Ordering};
use std::cell::UnsafeCell;

pub const NO_ERA: u64 = 0;

/// Implemented by objects whose lifetime is tracked by era window.
pub trait EraTracked {
    fn new_era(&self) -> u64;
    fn del_era(&self) -> u64;
}

pub struct HazardEras<T: EraTracked> {
    he: Box<[CacheAligned<AtomicU64>]>,
    // Owner-only: retired[tid] is touched exclusively by thread tid.
    retired: Box<[CacheAligned<UnsafeCell<Vec<Box<T>>>>]>,
}

unsafe impl<T: EraTracked + Send> Send for HazardEras<T> {}
unsafe impl<T: EraTracked + Send> Sync for HazardEras<T> {}

impl<T: EraTracked> HazardEras<T> {
    pub fn new() -> Self {
        let he = (0..MAX_THREADS)
            .map(|_| CacheAligned::new(AtomicU64::new(NO_ERA)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let retired = (0..MAX_THREADS)
            .map(|_| CacheAligned::new(UnsafeCell::new(Vec::with_capacity(MAX_THREADS))))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { he, retired }
    }

    /// Progress condition: wait-free population oblivious
    pub fn set(&self, era: u64, tid: usize) {
        self.he[tid].store(era, Ordering::SeqCst);
    }

    /// Progress condition: wait-free population oblivious
    pub fn clear(&self, tid: usize) {
        self.he[tid].store(NO_ERA, Ordering::Release);
    }

    /// Progress condition: wait-free population oblivious
    pub fn retire(&self, obj: Box<T>, tid: usize) {
        let retired = unsafe { &mut *self.retired[tid].get() };
        retired.push(obj);
    }

    /// Sweeps the caller's retired list once, deleting everything whose era
    /// window is clear of all published eras. Objects from the current era
    /// are never deleted.
    ///
    /// Progress condition: bounded wait-free
    pub fn clean(&self, cur_era: u64, tid: usize) {
        let retired = unsafe { &mut *self.retired[tid].get() };
        let mut i = 0;
        while i < retired.len() {
            if self.can_delete(cur_era, &retired[i]) {
                retired.swap_remove(i);
                continue;
            }
            i += 1;
        }
    }

    /// Progress condition: wait-free bounded (by the number of threads)
    pub fn can_delete(&self, cur_era: u64, obj: &T) -> bool {
        if obj.del_era() == cur_era {
            return false;
        }
        for it in 0..registry::max_threads() {
            let era = self.he[it].load(Ordering::Acquire);
            if era == NO_ERA || era < obj.new_era() || era > obj.del_era() {
                continue;
            }
            return false;
        }
        true
    }
}

impl<T: EraTracked> Default for HazardEras<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::get_tid;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    struct Closure {
        new_era: u64,
        del_era: u64,
        drops: Arc<AtomicUsize>,
    }

    impl EraTracked for Closure {
        fn new_era(&self) -> u64 {
            self.new_era
        }
        fn del_era(&self) -> u64 {
            self.del_era
        }
    }

    impl Drop for Closure {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_era_window_blocks_deletion() {
        let he = HazardEras::<Closure>::new();
        let tid = get_tid();
        let drops = Arc::new(AtomicUsize::new(0));

        he.retire(
            Box::new(Closure {
                new_era: 3,
                del_era: 5,
                drops: drops.clone(),
            }),
            tid,
        );

        // A published era inside [3, 5] pins the closure.
        he.set(4, tid);
        he.clean(10, tid);
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        // An era outside the window releases it.
        he.set(7, tid);
        he.clean(10, tid);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        he.clear(tid);
    }

    #[test]
    fn test_current_era_objects_survive() {
        let he = HazardEras::<Closure>::new();
        let tid = get_tid();
        let drops = Arc::new(AtomicUsize::new(0));

        he.retire(
            Box::new(Closure {
                new_era: 1,
                del_era: 6,
                drops: drops.clone(),
            }),
            tid,
        );

        // del_era equals the current era: never deleted, even with no
        // published era anywhere.
        he.clean(6, tid);
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        he.clean(7, tid);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
