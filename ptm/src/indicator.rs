// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Distributed read indicator: one flag per thread slot, so arrivals and
//! departures never contend on a shared counter. Emptiness is an O(threads)
//! scan bounded by the registry watermark.

use crate::pad::CacheAligned;
use crate::registry::{self, MAX_THREADS};
use core::sync::atomic::{AtomicU64, Ordering};

const NOT_READING: u64 = 0;
const READING: u64 = 1;

pub struct ReadIndicator {
    states: Box<[CacheAligned<AtomicU64>]>,
}

impl ReadIndicator {
    pub fn new() -> Self {
        let states = (0..MAX_THREADS)
            .map(|_| CacheAligned::new(AtomicU64::new(NOT_READING)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { states }
    }

    /// Progress condition: wait-free population oblivious
    pub fn arrive(&self, tid: usize) {
        self.states[tid].store(READING, Ordering::SeqCst);
    }

    /// Progress condition: wait-free population oblivious
    pub fn depart(&self, tid: usize) {
        self.states[tid].store(NOT_READING, Ordering::Release);
    }

    /// True only if no arrival is outstanding.
    pub fn is_empty(&self) -> bool {
        for tid in 0..registry::max_threads() {
            if self.states[tid].load(Ordering::SeqCst) != NOT_READING {
                return false;
            }
        }
        true
    }
}

impl Default for ReadIndicator {
    fn default() -> Self {
        Self::new()
    }
}
