// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Engine core shared by the lock-free and wait-free variants: the layout
//! of the persistent metadata, the begin/commit/help-apply protocol and the
//! transaction handle through which all cell accesses run.

use crate::cell::{TmCell, TmValue};
use crate::word::{seqidx_to_trans, trans_to_idx, trans_to_seq, TaggedWord};
use crate::wset::{PWriteSet, WriteSet};
use core::mem::size_of;
use core::ptr;
use core::sync::atomic::{fence, AtomicU64, Ordering};
use std::cell::UnsafeCell;
use stronghold_ptm::registry::{self, MAX_THREADS};
use stronghold_ptm::{CacheAligned, EsLoco, PmemConfig, PmemRegion, TxError};

/// Slots in the persistent root-pointer table.
pub const MAX_ROOT_POINTERS: usize = 100;

const MAGIC_ID: u64 = 0x1337_babe;

/// Persistent metadata at the start of the mapped region. The rest of the
/// region belongs to the allocator. `id` is last: it is written after
/// everything else is laid out and flushed, so a matching magic implies a
/// fully initialized header.
#[repr(C)]
#[allow(dead_code)]
struct PMetadata {
    cur_tx: AtomicU64,
    pad1: [u64; 15],
    root_ptrs: [TaggedWord; MAX_ROOT_POINTERS],
    plogs: [PWriteSet; MAX_THREADS],
    id: u64,
    pad2: u64,
}

/// Volatile per-thread engine state.
pub(crate) struct OpData {
    /// Transaction identifier snapshotted at begin (owner thread only).
    pub cur_tx: u64,
    /// Nesting depth; nested bodies run flat inside the outer transaction.
    pub nested: u64,
}

pub struct OfCore {
    pub(crate) region: PmemRegion,
    pub(crate) fences: &'static dyn stronghold_ptm::NvmFence,
    pmd: *mut PMetadata,
    pub(crate) esloco: EsLoco<TmCell<u64>, OfTx>,
    pub(crate) write_sets: Box<[CacheAligned<WriteSet>]>,
    op_data: Box<[CacheAligned<UnsafeCell<OpData>>]>,
}

unsafe impl Send for OfCore {}
unsafe impl Sync for OfCore {}

impl OfCore {
    pub(crate) fn new(cfg: PmemConfig) -> Self {
        assert!(
            size_of::<PMetadata>() <= cfg.region_size / 2,
            "persistent logs take more than half the region; grow the region"
        );
        let region = PmemRegion::map(&cfg.file_path, cfg.map_addr, cfg.region_size);
        let fences = cfg.fences;
        let pmd = region.base() as *mut PMetadata;
        let heap_addr = region.base() as usize + size_of::<PMetadata>();
        let heap_size = region.len() - size_of::<PMetadata>();

        let reuse = !region.is_new() && unsafe { ptr::addr_of!((*pmd).id).read() } == MAGIC_ID;
        let esloco;
        if reuse {
            log::info!("onefile: re-using persistent region");
            esloco = EsLoco::new(heap_addr, heap_size, false);
        } else {
            unsafe {
                ptr::write_bytes(region.base(), 0, size_of::<PMetadata>());
                (*pmd).cur_tx.store(seqidx_to_trans(1, 0), Ordering::Relaxed);
            }
            esloco = EsLoco::new(heap_addr, heap_size, true);
            fences.pfence();
            unsafe { ptr::addr_of_mut!((*pmd).id).write(MAGIC_ID) };
            fences.pwb(unsafe { ptr::addr_of!((*pmd).id) } as *const u8);
            fences.pfence();
        }

        let write_sets = (0..MAX_THREADS)
            .map(|_| CacheAligned::new(WriteSet::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let op_data = (0..MAX_THREADS)
            .map(|_| CacheAligned::new(UnsafeCell::new(OpData { cur_tx: 0, nested: 0 })))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let core = Self {
            region,
            fences,
            pmd,
            esloco,
            write_sets,
            op_data,
        };
        if reuse {
            core.recover();
        }
        core
    }

    pub(crate) fn cur_tx(&self) -> &AtomicU64 {
        unsafe { &(*self.pmd).cur_tx }
    }

    pub(crate) fn current_seq(&self) -> u64 {
        trans_to_seq(self.cur_tx().load(Ordering::Acquire))
    }

    fn plog(&self, tid: usize) -> *mut PWriteSet {
        unsafe { ptr::addr_of_mut!((*self.pmd).plogs[tid]) }
    }

    pub(crate) fn opd(&self, tid: usize) -> *mut OpData {
        self.op_data[tid].get()
    }

    pub(crate) fn root_cell<T: TmValue>(&self, idx: usize) -> &TmCell<T> {
        assert!(idx < MAX_ROOT_POINTERS, "root pointer index out of range");
        unsafe { &*(ptr::addr_of!((*self.pmd).root_ptrs[idx]) as *const TmCell<T>) }
    }

    /// Lock-free starting fence: helps the last published writer finish,
    /// then confirms the transaction identifier did not move.
    pub(crate) fn begin_tx(&self, tid: usize) -> u64 {
        loop {
            let ltx = self.cur_tx().load(Ordering::Acquire);
            self.help_apply(ltx, tid);
            // Reset the write-set after (possibly) helping another
            // transaction complete
            self.write_sets[tid].reset();
            if ltx == self.cur_tx().load(Ordering::Acquire) {
                return ltx;
            }
        }
    }

    /// Publishes the write-set, CASes the transaction identifier and applies
    /// the log. Returns false if the transaction lost the race and must
    /// retry from begin.
    ///
    /// Progress condition: wait-free population oblivious
    pub(crate) fn commit_tx(&self, tid: usize, my_tx: u64) -> bool {
        if self.write_sets[tid].num_stores() == 0 {
            // Read-only transactions commit immediately
            return true;
        }
        if my_tx != self.cur_tx().load(Ordering::Acquire) {
            return false;
        }
        let seq = trans_to_seq(my_tx);
        let new_tx = seqidx_to_trans(seq + 1, tid as u64);
        let plog = self.plog(tid);
        // Open our request with the next sequence, then persist the log
        unsafe {
            PWriteSet::request(plog).store(new_tx, Ordering::Release);
            PWriteSet::persist_from(plog, &self.write_sets[tid], self.fences);
        }
        if self
            .cur_tx()
            .compare_exchange(my_tx, new_tx, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        // Linearization point passed; the DCAS application below can be
        // finished by any thread
        self.fences.pwb(self.cur_tx() as *const AtomicU64 as *const u8);
        self.help_apply(new_tx, tid);
        true
    }

    /// Applies the log published under `lcur`. Helpers copy the owner's
    /// write-set and drop the copy if either the transaction identifier or
    /// the request moved underneath them.
    ///
    /// Progress condition: wait-free population oblivious
    pub(crate) fn help_apply(&self, lcur: u64, tid: usize) {
        let idx = trans_to_idx(lcur) as usize;
        let seq = trans_to_seq(lcur);
        let plog = self.plog(idx);
        let request = unsafe { PWriteSet::request(plog) };
        if lcur != request.load(Ordering::Acquire) {
            return;
        }
        if idx != tid {
            self.write_sets[tid].copy_from(&self.write_sets[idx]);
            fence(Ordering::Acquire);
            if lcur != self.cur_tx().load(Ordering::SeqCst) {
                return;
            }
            if lcur != request.load(Ordering::Acquire) {
                return;
            }
        }
        self.write_sets[tid].apply(seq, tid);
        self.write_sets[tid].flush_modifications(self.fences);
        if request.load(Ordering::Acquire) == lcur {
            let new_req = seqidx_to_trans(seq + 1, idx as u64);
            let _ = request.compare_exchange(lcur, new_req, Ordering::AcqRel, Ordering::Relaxed);
        }
    }

    /// Re-applies the last published log after a restart. Redundant on
    /// x86-TSO, where the commit DCASes reach the controller atomically,
    /// but idempotent and cheap.
    fn recover(&self) {
        let lcur = self.cur_tx().load(Ordering::Acquire);
        let idx = trans_to_idx(lcur) as usize;
        unsafe { PWriteSet::apply_from_recover(self.plog(idx), self.fences) };
        self.fences.psync();
    }

    /// Lock-free transaction driver: begin, run the body, commit, retrying
    /// while the body aborts or the commit loses the publication race.
    pub(crate) fn transaction<R>(
        &self,
        f: &mut dyn FnMut(&mut OfTx) -> Result<R, TxError>,
    ) -> Result<R, TxError> {
        let tid = registry::get_tid();
        let opd = self.opd(tid);
        if unsafe { (*opd).nested } > 0 {
            let mut tx = OfTx::nested(self, tid, unsafe { (*opd).cur_tx });
            return f(&mut tx);
        }
        unsafe { (*opd).nested += 1 };
        let result = loop {
            let ltx = self.begin_tx(tid);
            unsafe { (*opd).cur_tx = ltx };
            let mut tx = OfTx::fresh(self, tid, ltx);
            match f(&mut tx) {
                Ok(r) => {
                    if self.commit_tx(tid, ltx) {
                        break Ok(r);
                    }
                }
                Err(TxError::Aborted) => continue,
                Err(e) => break Err(e),
            }
        };
        unsafe { (*opd).nested -= 1 };
        result
    }
}

/// Handle for one transaction attempt. Every transactional cell access goes
/// through it, carrying the snapshot that decides when a load must abort.
pub struct OfTx {
    core: *const OfCore,
    tid: usize,
    my_tx: u64,
    read_only: bool,
}

impl OfTx {
    pub(crate) fn fresh(core: &OfCore, tid: usize, my_tx: u64) -> Self {
        Self {
            core,
            tid,
            my_tx,
            // An update transaction is read-only until its first store
            read_only: true,
        }
    }

    pub(crate) fn nested(core: &OfCore, tid: usize, my_tx: u64) -> Self {
        Self {
            core,
            tid,
            my_tx,
            read_only: false,
        }
    }

    fn core<'a>(&self) -> &'a OfCore {
        unsafe { &*self.core }
    }

    pub fn tid(&self) -> usize {
        self.tid
    }

    pub(crate) fn snapshot(&self) -> u64 {
        self.my_tx
    }

    /// Transactional load. Aborts when the word was written by a
    /// transaction newer than this snapshot: the value could belong to
    /// reclaimed memory or break an invariant the body relies on.
    pub fn load<T: TmValue>(&mut self, cell: &TmCell<T>) -> Result<T, TxError> {
        let lval = cell.word().load_val();
        let core = self.core();
        let addr = cell as *const TmCell<T> as usize;
        if !core.region.contains(addr) {
            return Ok(T::from_word(lval));
        }
        let lseq = cell.word().load_seq();
        if lseq > trans_to_seq(self.my_tx) {
            return Err(TxError::Aborted);
        }
        if self.read_only {
            return Ok(T::from_word(lval));
        }
        Ok(T::from_word(
            core.write_sets[self.tid].lookup(addr, lval),
        ))
    }

    /// Transactional store; recorded in the write-set and applied at commit.
    pub fn store<T: TmValue>(&mut self, cell: &TmCell<T>, v: T) {
        self.read_only = false;
        let addr = cell as *const TmCell<T> as usize;
        self.core().write_sets[self.tid].add_or_replace(addr, v.into_word());
    }

    /// Allocates room for a `T` inside the persistent heap. Returns null
    /// when the heap is exhausted. The caller initializes the object's
    /// cells through this handle before publishing it.
    pub fn alloc<T>(&mut self) -> Result<*mut T, TxError> {
        let core = self.core();
        let addr = core.esloco.malloc(size_of::<T>() as u64, self)?;
        Ok(addr as usize as *mut T)
    }

    pub fn dealloc<T>(&mut self, obj: *mut T) -> Result<(), TxError> {
        let core = self.core();
        core.esloco.free(obj as usize as u64, self)
    }

    pub fn tm_malloc(&mut self, size: usize) -> Result<*mut u8, TxError> {
        let core = self.core();
        let addr = core.esloco.malloc(size as u64, self)?;
        Ok(addr as usize as *mut u8)
    }

    pub fn tm_free(&mut self, obj: *mut u8) -> Result<(), TxError> {
        let core = self.core();
        core.esloco.free(obj as usize as u64, self)
    }

    /// Reads slot `idx` of the persistent root-pointer table.
    pub fn get_root<T: TmValue>(&mut self, idx: usize) -> Result<T, TxError> {
        let cell = self.core().root_cell::<T>(idx);
        self.load(cell)
    }

    /// Stores into slot `idx` of the persistent root-pointer table.
    pub fn put_root<T: TmValue>(&mut self, idx: usize, v: T) {
        let cell = self.core().root_cell::<T>(idx);
        self.store(cell, v);
    }
}
