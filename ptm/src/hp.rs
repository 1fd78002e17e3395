// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Hazard pointers: each thread publishes the pointers it is about to
//! dereference; a retired pointer is reclaimed only once no published slot
//! references it. The auxiliary `heads` pool holds per-thread list heads
//! that are already covered by a regular slot but must survive the slot
//! being repointed.

use crate::pad::CacheAligned;
use crate::registry::MAX_THREADS;
use core::sync::atomic::{AtomicPtr, Ordering};
use std::cell::UnsafeCell;
use std::ptr;

/// Hazard pointer slots per thread.
pub const MAX_HPS: usize = 5;

// Named 'R' in the hazard pointer paper. Zero means every retire scans.
const THRESHOLD_R: usize = 0;

pub struct HazardPointers<T> {
    max_hps: usize,
    hp: Box<[CacheAligned<[AtomicPtr<T>; MAX_HPS]>]>,
    // Owner-only: retired[tid] is touched exclusively by thread tid.
    retired: Box<[CacheAligned<UnsafeCell<Vec<*mut T>>>]>,
    heads: Box<[CacheAligned<AtomicPtr<T>>]>,
}

unsafe impl<T: Send> Send for HazardPointers<T> {}
unsafe impl<T: Send> Sync for HazardPointers<T> {}

impl<T> HazardPointers<T> {
    pub fn new(max_hps: usize) -> Self {
        assert!(max_hps <= MAX_HPS);
        let hp = (0..MAX_THREADS)
            .map(|_| {
                CacheAligned::new([(); MAX_HPS].map(|_| AtomicPtr::new(ptr::null_mut())))
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let retired = (0..MAX_THREADS)
            .map(|_| CacheAligned::new(UnsafeCell::new(Vec::new())))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let heads = (0..2 * MAX_THREADS)
            .map(|_| CacheAligned::new(AtomicPtr::new(ptr::null_mut())))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            max_hps,
            hp,
            retired,
            heads,
        }
    }

    /// Progress condition: wait-free bounded (by the number of slots)
    pub fn clear(&self, tid: usize) {
        for ihp in 0..self.max_hps {
            self.hp[tid][ihp].store(ptr::null_mut(), Ordering::Relaxed);
        }
    }

    /// Progress condition: wait-free population oblivious
    pub fn clear_one(&self, ihp: usize, tid: usize) {
        self.hp[tid][ihp].store(ptr::null_mut(), Ordering::Relaxed);
    }

    /// Publish-and-recheck loop: publishes the pointer read from `atom` and
    /// re-reads until the published value is stable.
    ///
    /// Progress condition: lock-free
    pub fn protect(&self, index: usize, atom: &AtomicPtr<T>, tid: usize) -> *mut T {
        let mut published: *mut T = ptr::null_mut();
        loop {
            let cur = atom.load(Ordering::SeqCst);
            if cur == published {
                return cur;
            }
            self.hp[tid][index].store(cur, Ordering::SeqCst);
            published = cur;
        }
    }

    /// Publishes a pointer that is already known. Returns it back, which is
    /// sometimes convenient at call sites.
    ///
    /// Progress condition: wait-free population oblivious
    pub fn protect_ptr(&self, index: usize, p: *mut T, tid: usize) -> *mut T {
        self.hp[tid][index].store(p, Ordering::SeqCst);
        p
    }

    /// Same as [`HazardPointers::protect_ptr`] with a release store.
    pub fn protect_release(&self, index: usize, p: *mut T, tid: usize) -> *mut T {
        self.hp[tid][index].store(p, Ordering::Release);
        p
    }

    /// Parks a list head in the auxiliary pool. The caller must already hold
    /// `p` in a regular slot.
    pub fn protect_head(&self, combined_index: usize, p: *mut T) {
        self.heads[combined_index].store(p, Ordering::Release);
    }

    pub fn clear_head(&self, combined_index: usize) {
        self.heads[combined_index].store(ptr::null_mut(), Ordering::Release);
    }

    /// Hands a detached pointer over for deferred reclamation.
    ///
    /// # Safety
    /// `p` must have been obtained from `Box::into_raw` and must be
    /// unreachable for new readers (only previously published slots may
    /// still reference it).
    pub unsafe fn retire(&self, p: *mut T, tid: usize) {
        let retired = &mut *self.retired[tid].get();
        if retired.len() >= THRESHOLD_R {
            self.scan_and_delete(retired);
        }
        retired.push(p);
    }

    fn scan_and_delete(&self, retired: &mut Vec<*mut T>) {
        let mut iret = 0;
        while iret < retired.len() {
            let p = retired[iret];
            let mut in_use = false;
            for it in 0..MAX_THREADS {
                for ihp in (0..self.max_hps).rev() {
                    if self.hp[it][ihp].load(Ordering::SeqCst) == p {
                        in_use = true;
                    }
                }
            }
            if !in_use {
                for icomb in 0..2 * MAX_THREADS {
                    if self.heads[icomb].load(Ordering::SeqCst) == p {
                        in_use = true;
                    }
                }
            }
            if in_use {
                iret += 1;
                continue;
            }
            retired.swap_remove(iret);
            drop(unsafe { Box::from_raw(p) });
        }
    }
}

impl<T> Drop for HazardPointers<T> {
    fn drop(&mut self) {
        for slot in self.retired.iter() {
            let retired = unsafe { &mut *slot.get() };
            for &p in retired.iter() {
                drop(unsafe { Box::from_raw(p) });
            }
            retired.clear();
        }
    }
}
