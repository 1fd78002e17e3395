// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The write-set: a per-thread redo log of the words modified by the
//! running transaction, with an intrusive hash map for O(1) lookup once the
//! log outgrows a short linear scan. Entries are relaxed atomics because a
//! helping thread copies a foreign write-set racily and then revalidates the
//! transaction identifier before using the copy.
//!
//! [`PWriteSet`] is the persistent twin: the log as it is written to the
//! mapped region right before the commit CAS, together with the `request`
//! word that opens and closes the application of the log.

use crate::word::TaggedWord;
use core::mem::size_of;
use core::ptr;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use stronghold_ptm::NvmFence;

/// Maximum number of stores in one transaction.
pub const TX_MAX_STORES: usize = 4 * 1024;
/// Buckets in the intrusive hash map.
const HASH_BUCKETS: usize = 1024;
/// Below this store count a linear scan beats the hash map.
const MAX_ARRAY_LOOKUP: usize = 30;

const NIL: u32 = u32::MAX;

struct WsEntry {
    addr: AtomicUsize,
    val: AtomicU64,
    // Index of the next entry in the same bucket, or NIL.
    next: AtomicU32,
}

pub struct WriteSet {
    num_stores: AtomicU64,
    log: Box<[WsEntry]>,
    buckets: Box<[AtomicU32]>,
}

impl WriteSet {
    pub fn new() -> Self {
        let log = (0..TX_MAX_STORES)
            .map(|_| WsEntry {
                addr: AtomicUsize::new(0),
                val: AtomicU64::new(0),
                next: AtomicU32::new(NIL),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let buckets = (0..HASH_BUCKETS)
            .map(|_| AtomicU32::new(NIL))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            num_stores: AtomicU64::new(0),
            log,
            buckets,
        }
    }

    #[inline]
    fn hash(addr: usize) -> usize {
        (addr >> 3) % HASH_BUCKETS
    }

    pub fn num_stores(&self) -> u64 {
        self.num_stores.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.num_stores.store(0, Ordering::Relaxed);
    }

    pub(crate) fn entry_addr(&self, i: usize) -> usize {
        self.log[i].addr.load(Ordering::Relaxed)
    }

    pub(crate) fn entry_val(&self, i: usize) -> u64 {
        self.log[i].val.load(Ordering::Relaxed)
    }

    /// A bucket head is only trusted if it points into the live prefix of
    /// the log and its entry still hashes to the bucket; anything else is a
    /// leftover from an earlier transaction.
    fn bucket_valid(&self, head: u32, n: usize, bucket: usize) -> bool {
        (head as usize) < n && Self::hash(self.log[head as usize].addr.load(Ordering::Relaxed)) == bucket
    }

    /// Records a store, replacing any earlier store to the same address.
    pub fn add_or_replace(&self, addr: usize, val: u64) {
        let n = self.num_stores.load(Ordering::Relaxed) as usize;
        let bucket = Self::hash(addr);
        if n < MAX_ARRAY_LOOKUP {
            for i in 0..n {
                if self.log[i].addr.load(Ordering::Relaxed) == addr {
                    self.log[i].val.store(val, Ordering::Relaxed);
                    return;
                }
            }
        } else {
            let head = self.buckets[bucket].load(Ordering::Relaxed);
            if self.bucket_valid(head, n, bucket) {
                let mut cur = head;
                while cur != NIL {
                    let e = &self.log[cur as usize];
                    if e.addr.load(Ordering::Relaxed) == addr {
                        e.val.store(val, Ordering::Relaxed);
                        return;
                    }
                    cur = e.next.load(Ordering::Relaxed);
                }
            }
        }
        assert!(
            n < TX_MAX_STORES,
            "write-set overflow: transaction exceeds {} stores",
            TX_MAX_STORES
        );
        let e = &self.log[n];
        e.addr.store(addr, Ordering::Relaxed);
        e.val.store(val, Ordering::Relaxed);
        let head = self.buckets[bucket].load(Ordering::Relaxed);
        let link = if self.bucket_valid(head, n, bucket) { head } else { NIL };
        e.next.store(link, Ordering::Relaxed);
        self.buckets[bucket].store(n as u32, Ordering::Relaxed);
        self.num_stores.store((n + 1) as u64, Ordering::Relaxed);
    }

    /// Returns the value this transaction wants at `addr`, or `lval` when
    /// the address was never stored to.
    pub fn lookup(&self, addr: usize, lval: u64) -> u64 {
        let n = self.num_stores.load(Ordering::Relaxed) as usize;
        if n < MAX_ARRAY_LOOKUP {
            for i in 0..n {
                if self.log[i].addr.load(Ordering::Relaxed) == addr {
                    return self.log[i].val.load(Ordering::Relaxed);
                }
            }
        } else {
            let bucket = Self::hash(addr);
            let head = self.buckets[bucket].load(Ordering::Relaxed);
            if self.bucket_valid(head, n, bucket) {
                let mut cur = head;
                while cur != NIL {
                    let e = &self.log[cur as usize];
                    if e.addr.load(Ordering::Relaxed) == addr {
                        return e.val.load(Ordering::Relaxed);
                    }
                    cur = e.next.load(Ordering::Relaxed);
                }
            }
        }
        lval
    }

    /// Racy copy of another thread's write-set; the caller revalidates the
    /// transaction identifier and the request word before applying it.
    pub fn copy_from(&self, other: &WriteSet) {
        let n = (other.num_stores.load(Ordering::Acquire) as usize).min(TX_MAX_STORES);
        for i in 0..n {
            self.log[i]
                .addr
                .store(other.log[i].addr.load(Ordering::Relaxed), Ordering::Relaxed);
            self.log[i]
                .val
                .store(other.log[i].val.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        self.num_stores.store(n as u64, Ordering::Relaxed);
    }

    /// Applies every entry with a DCAS gated on the word's sequence; a word
    /// that some other helper already moved to `seq` is left alone.
    pub fn apply(&self, seq: u64, tid: usize) {
        let n = self.num_stores.load(Ordering::Relaxed) as usize;
        if n == 0 {
            return;
        }
        for i in 0..n {
            // Heuristic: stagger the starting entry per thread so helpers
            // do not pile up on the same DCAS.
            let e = &self.log[(tid * 8 + i) % n];
            let word = unsafe { &*(e.addr.load(Ordering::Relaxed) as *const TaggedWord) };
            let lval = word.load_val();
            let lseq = word.load_seq();
            if lseq < seq {
                word.dcas(lval, lseq, e.val.load(Ordering::Relaxed), seq);
            }
        }
    }

    pub fn flush_modifications(&self, fences: &dyn NvmFence) {
        let n = self.num_stores.load(Ordering::Relaxed) as usize;
        for i in 0..n {
            fences.pwb(self.log[i].addr.load(Ordering::Relaxed) as *const u8);
        }
    }
}

impl Default for WriteSet {
    fn default() -> Self {
        Self::new()
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct PEntry {
    pub addr: u64,
    pub val: u64,
}

/// Layout of a per-thread persistent redo log inside the region header.
/// Never constructed; always viewed through a pointer into the mapping.
#[repr(C)]
pub struct PWriteSet {
    num_stores: u64,
    request: AtomicU64,
    entries: [PEntry; TX_MAX_STORES],
}

impl PWriteSet {
    pub unsafe fn request<'a>(p: *mut PWriteSet) -> &'a AtomicU64 {
        &(*p).request
    }

    /// Copies the volatile write-set into the persistent log and flushes it,
    /// right before the commit CAS publishes the transaction.
    pub unsafe fn persist_from(p: *mut PWriteSet, ws: &WriteSet, fences: &dyn NvmFence) {
        let n = ws.num_stores() as usize;
        for i in 0..n {
            ptr::addr_of_mut!((*p).entries[i]).write(PEntry {
                addr: ws.entry_addr(i) as u64,
                val: ws.entry_val(i),
            });
        }
        ptr::addr_of_mut!((*p).num_stores).write(n as u64);
        let len = size_of::<u64>() + size_of::<AtomicU64>() + (n + 1) * size_of::<PEntry>();
        fences.flush_range(ptr::addr_of!((*p).num_stores) as *const u8, len);
    }

    /// Replays the log with plain stores. Only called from single-threaded
    /// recovery; idempotent because it rewrites the same values.
    pub unsafe fn apply_from_recover(p: *mut PWriteSet, fences: &dyn NvmFence) {
        let n = ((*p).num_stores as usize).min(TX_MAX_STORES);
        for i in 0..n {
            let e = *ptr::addr_of!((*p).entries[i]);
            *(e.addr as usize as *mut u64) = e.val;
            fences.pwb(e.addr as usize as *const u8);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_or_replace_coalesces() {
        let ws = WriteSet::new();
        ws.add_or_replace(0x1000, 1);
        ws.add_or_replace(0x1010, 2);
        ws.add_or_replace(0x1000, 3);
        assert_eq!(ws.num_stores(), 2);
        assert_eq!(ws.lookup(0x1000, 99), 3);
        assert_eq!(ws.lookup(0x1010, 99), 2);
        assert_eq!(ws.lookup(0x2000, 99), 99);
    }

    #[test]
    fn test_hash_path_beyond_linear_scan() {
        let ws = WriteSet::new();
        for i in 0..100usize {
            ws.add_or_replace(0x4000 + i * 16, i as u64);
        }
        // Well past MAX_ARRAY_LOOKUP: lookups and replacements go through
        // the bucket chains.
        for i in 0..100usize {
            assert_eq!(ws.lookup(0x4000 + i * 16, 999), i as u64);
        }
        ws.add_or_replace(0x4000, 1234);
        assert_eq!(ws.num_stores(), 100);
        assert_eq!(ws.lookup(0x4000, 999), 1234);
    }

    #[test]
    fn test_reset_discards_entries() {
        let ws = WriteSet::new();
        for i in 0..50usize {
            ws.add_or_replace(0x8000 + i * 16, 7);
        }
        ws.reset();
        assert_eq!(ws.num_stores(), 0);
        assert_eq!(ws.lookup(0x8000, 5), 5);
        // Stale buckets from the previous transaction must not leak into
        // the next one.
        ws.add_or_replace(0x9000, 1);
        assert_eq!(ws.lookup(0x8000 + 16, 5), 5);
    }

    #[test]
    fn test_copy_from_mirrors_log() {
        let a = WriteSet::new();
        let b = WriteSet::new();
        a.add_or_replace(0x1000, 11);
        a.add_or_replace(0x1010, 22);
        b.copy_from(&a);
        assert_eq!(b.num_stores(), 2);
        assert_eq!(b.lookup(0x1000, 0), 11);
        assert_eq!(b.lookup(0x1010, 0), 22);
    }
}
