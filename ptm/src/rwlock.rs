// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! C-RW-WP: a reader-writer lock with writer preference. Writers grab a
//! cohort spin lock and then drain the read indicator; readers announce
//! themselves and back off while a writer holds the cohort.

use crate::indicator::ReadIndicator;
use crate::pad::CacheAligned;
use core::hint;
use core::sync::atomic::{AtomicU64, Ordering};

const UNLOCKED: u64 = 0;
const LOCKED: u64 = 1;

pub struct SpinLock {
    word: CacheAligned<AtomicU64>,
}

impl SpinLock {
    pub const fn new() -> Self {
        Self {
            word: CacheAligned::new(AtomicU64::new(UNLOCKED)),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.word.load(Ordering::SeqCst) == LOCKED
    }

    pub fn lock(&self) {
        while !self.try_lock() {
            hint::spin_loop();
        }
    }

    pub fn try_lock(&self) -> bool {
        if self.word.load(Ordering::SeqCst) == LOCKED {
            return false;
        }
        self.word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    pub fn unlock(&self) {
        self.word.store(UNLOCKED, Ordering::Release);
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CrwwpLock {
    ri: ReadIndicator,
    cohort: SpinLock,
}

impl CrwwpLock {
    pub fn new() -> Self {
        Self {
            ri: ReadIndicator::new(),
            cohort: SpinLock::new(),
        }
    }

    pub fn exclusive_lock(&self) {
        self.cohort.lock();
        while !self.ri.is_empty() {
            hint::spin_loop();
        }
    }

    /// Takes the cohort only. Callers that need reader drain must follow up
    /// with [`CrwwpLock::wait_for_readers`].
    ///
    /// Progress condition: wait-free
    pub fn try_exclusive_lock(&self) -> bool {
        self.cohort.try_lock()
    }

    pub fn exclusive_unlock(&self) {
        self.cohort.unlock();
    }

    pub fn shared_lock(&self, tid: usize) {
        loop {
            self.ri.arrive(tid);
            if !self.cohort.is_locked() {
                return;
            }
            self.ri.depart(tid);
            while self.cohort.is_locked() {
                hint::spin_loop();
            }
        }
    }

    pub fn shared_unlock(&self, tid: usize) {
        self.ri.depart(tid);
    }

    pub fn wait_for_readers(&self) {
        while !self.ri.is_empty() {
            hint::spin_loop();
        }
    }
}

impl Default for CrwwpLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::get_tid;
    use std::sync::atomic::{AtomicU64 as StdAtomicU64, Ordering as StdOrdering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_spinlock_mutual_exclusion() {
        let lock = Arc::new(SpinLock::new());
        let counter = Arc::new(StdAtomicU64::new(0));

        let mut handles = vec![];
        for _ in 0..4 {
            let lock = lock.clone();
            let counter = counter.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    lock.lock();
                    let v = counter.load(StdOrdering::Relaxed);
                    counter.store(v + 1, StdOrdering::Relaxed);
                    lock.unlock();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(StdOrdering::SeqCst), 4000);
    }

    #[test]
    fn test_writer_drains_readers() {
        let lock = Arc::new(CrwwpLock::new());

        let reader = {
            let lock = lock.clone();
            thread::spawn(move || {
                let tid = get_tid();
                lock.shared_lock(tid);
                thread::sleep(Duration::from_millis(50));
                lock.shared_unlock(tid);
            })
        };

        thread::sleep(Duration::from_millis(10));
        // The reader is inside its critical section: the cohort is free but
        // the drain must block until the reader departs.
        assert!(lock.try_exclusive_lock());
        lock.wait_for_readers();
        lock.exclusive_unlock();
        reader.join().unwrap();
    }

    #[test]
    fn test_readers_wait_for_writer() {
        let lock = Arc::new(CrwwpLock::new());
        lock.exclusive_lock();

        let reader = {
            let lock = lock.clone();
            thread::spawn(move || {
                let tid = get_tid();
                lock.shared_lock(tid);
                lock.shared_unlock(tid);
            })
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!reader.is_finished());
        lock.exclusive_unlock();
        reader.join().unwrap();
    }
}
