// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The wait-free OneFile engine. On top of the lock-free core it adds a
//! consensus lane: each thread announces its transaction body as a
//! heap-allocated closure in its operation slot, and every committing
//! writer executes all unanswered closures as part of its own transaction
//! (`transform_all`), storing each return value into the owner's result
//! slot. A thread whose operation was answered by someone else simply
//! returns. Retired closures are reclaimed through hazard eras, with the
//! global transaction sequence as the era clock.

use crate::cell::{TmCell, TmValue};
use crate::engine::{OfCore, OfTx};
use crate::word::{trans_to_seq, TaggedWord};
use core::sync::atomic::Ordering;
use stronghold_ptm::registry::{self, MAX_THREADS};
use stronghold_ptm::{CacheAligned, EraTracked, HazardEras, Ptm, PmemConfig, TxError};

/// Failed optimistic read attempts before a reader poses as a writer.
pub const MAX_READ_TRIES: usize = 4;

/// An announced transaction body. Heap-allocated and type-erased so helper
/// threads can run it; the era window brackets the transactions during
/// which some helper may still hold a pointer to it.
pub struct TransFn {
    new_era: u64,
    del_era: u64,
    func: Box<dyn Fn(&mut OfTx) -> Result<u64, TxError> + Send + Sync>,
}

impl EraTracked for TransFn {
    fn new_era(&self) -> u64 {
        self.new_era
    }
    fn del_era(&self) -> u64 {
        self.del_era
    }
}

pub struct OneFileWf {
    core: OfCore,
    he: HazardEras<TransFn>,
    // Wait-free consensus slots: operations[i].val is a *mut TransFn with
    // the announce tag in seq; results[i] answers it.
    operations: Box<[CacheAligned<TaggedWord>]>,
    results: Box<[CacheAligned<TaggedWord>]>,
}

impl OneFileWf {
    pub fn new(cfg: PmemConfig) -> Self {
        let operations = (0..MAX_THREADS)
            .map(|_| CacheAligned::new(TaggedWord::new(0, 0)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        // A result sequence above the operation sequence means "answered",
        // which must hold before anything was announced.
        let results = (0..MAX_THREADS)
            .map(|_| CacheAligned::new(TaggedWord::new(0, 1)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            core: OfCore::new(cfg),
            he: HazardEras::new(),
            operations,
            results,
        }
    }

    pub fn default_config() -> PmemConfig {
        PmemConfig::new(
            "/dev/shm/onefile_wf_shared",
            0x7ff0_0000_0000,
            crate::PM_REGION_SIZE,
        )
    }

    pub fn current_seq(&self) -> u64 {
        self.core.current_seq()
    }

    /// Runs `f` as a mutating transaction. The closure is announced, so any
    /// committing thread may execute it (possibly more than once across
    /// retries); it must confine its effects to transactional stores.
    /// A real error returned by the body (anything but the internal abort
    /// sentinel) is handed back to the caller, unless a helper already
    /// committed the operation on our behalf.
    pub fn update_tx<R, F>(&self, f: F) -> Result<R, TxError>
    where
        R: TmValue,
        F: Fn(&mut OfTx) -> Result<R, TxError> + Send + Sync + 'static,
    {
        let tid = registry::get_tid();
        let opd = self.core.opd(tid);
        if unsafe { (*opd).nested } > 0 {
            let mut tx = OfTx::nested(&self.core, tid, unsafe { (*opd).cur_tx });
            return f(&mut tx);
        }
        let func: Box<dyn Fn(&mut OfTx) -> Result<u64, TxError> + Send + Sync> =
            Box::new(move |tx| f(tx).map(TmValue::into_word));
        let funcptr = Box::into_raw(Box::new(TransFn {
            new_era: 0,
            del_era: 0,
            func,
        }));
        self.inner_update_tx(tid, funcptr)?;
        Ok(R::from_word(self.results[tid].load_val()))
    }

    /// Read-only transaction: a bounded number of optimistic tries, then
    /// promotion to an announced update so helpers resolve it.
    ///
    /// Progress condition: wait-free (bounded by threads + MAX_READ_TRIES)
    pub fn read_tx<R, F>(&self, f: F) -> Result<R, TxError>
    where
        R: TmValue,
        F: Fn(&mut OfTx) -> Result<R, TxError> + Send + Sync + 'static,
    {
        let tid = registry::get_tid();
        let opd = self.core.opd(tid);
        if unsafe { (*opd).nested } > 0 {
            let mut tx = OfTx::nested(&self.core, tid, unsafe { (*opd).cur_tx });
            return f(&mut tx);
        }
        unsafe { (*opd).nested += 1 };
        self.core.write_sets[tid].reset();
        for _ in 0..MAX_READ_TRIES {
            let ltx = self.core.cur_tx().load(Ordering::Acquire);
            unsafe { (*opd).cur_tx = ltx };
            self.core.help_apply(ltx, tid);
            self.core.write_sets[tid].reset();
            // Protect the objects we are about to traverse
            self.he.set(trans_to_seq(ltx), tid);
            if ltx != self.core.cur_tx().load(Ordering::SeqCst) {
                continue;
            }
            let mut tx = OfTx::fresh(&self.core, tid, ltx);
            match f(&mut tx) {
                Ok(r) => {
                    unsafe { (*opd).nested -= 1 };
                    self.he.clear(tid);
                    return Ok(r);
                }
                Err(TxError::Aborted) => continue,
                Err(e) => {
                    unsafe { (*opd).nested -= 1 };
                    self.he.clear(tid);
                    return Err(e);
                }
            }
        }
        log::debug!("read_tx exhausted {} tries, posing as update_tx", MAX_READ_TRIES);
        unsafe { (*opd).nested -= 1 };
        self.update_tx(f)
    }

    /// Progress condition: wait-free (bounded by the number of threads).
    ///
    /// Four rounds suffice: with three sequences past the announce, the
    /// worst case is one transaction that missed the announce, one that
    /// transformed it without applying the write-set, and one that
    /// guarantees the application; the extra round covers the missing fence
    /// on the announce store.
    fn inner_update_tx(&self, tid: usize, funcptr: *mut TransFn) -> Result<(), TxError> {
        let opd = self.core.opd(tid);
        unsafe { (*opd).nested += 1 };
        // An era from before the announce, to protect the closure
        let first_era = self.core.current_seq();
        self.operations[tid].raw_store(funcptr as u64, self.results[tid].load_seq());
        let mut failed = None;
        for _ in 0..4 {
            self.core.write_sets[tid].reset();
            let ltx = self.core.cur_tx().load(Ordering::Acquire);
            unsafe { (*opd).cur_tx = ltx };
            // If my request is answered, my transaction is committed
            if self.results[tid].load_seq() > self.operations[tid].load_seq() {
                break;
            }
            self.core.help_apply(ltx, tid);
            self.core.write_sets[tid].reset();
            self.he.set(trans_to_seq(ltx), tid);
            if ltx != self.core.cur_tx().load(Ordering::SeqCst) {
                continue;
            }
            let mut tx = OfTx::fresh(&self.core, tid, ltx);
            match self.transform_all(&mut tx) {
                Ok(true) => {}
                Ok(false) | Err(TxError::Aborted) => continue,
                Err(e) => {
                    // Our own body failed for real. A helper may have
                    // answered it in the meantime, in which case the
                    // operation committed after all; otherwise withdraw
                    // the announce so no committer keeps executing it,
                    // and hand the error to the caller.
                    if self.results[tid].load_seq() > self.operations[tid].load_seq() {
                        break;
                    }
                    self.operations[tid].raw_store(0, self.operations[tid].load_seq());
                    failed = Some(e);
                    break;
                }
            }
            if self.core.commit_tx(tid, ltx) {
                // The commit succeeded; sweep our retired closures
                self.he.clean(self.core.current_seq(), tid);
                break;
            }
        }
        unsafe { (*opd).nested -= 1 };
        self.he.clear(tid);
        self.retire_func(tid, funcptr, first_era);
        match failed {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Executes every unanswered announced operation as part of `tx`,
    /// storing the return values into the owners' result slots. Returns
    /// false if the transaction identifier moved and the caller must retry.
    ///
    /// A [`TxError::Aborted`] from any body aborts the whole batch for a
    /// retry. A real error from the caller's own body is returned so the
    /// caller can surface it; a real error from someone else's body also
    /// aborts the batch (its partial stores must not commit) and is left
    /// for that owner to discover and withdraw.
    fn transform_all(&self, tx: &mut OfTx) -> Result<bool, TxError> {
        for i in 0..registry::max_threads() {
            let (opv, ops) = match self.operations[i].raw_load() {
                Some(pair) => pair,
                None => continue,
            };
            let (_resv, ress) = match self.results[i].raw_load() {
                Some(pair) => pair,
                None => continue,
            };
            if ress > ops {
                continue;
            }
            // Unanswered operation; bail out if the snapshot went stale
            if tx.snapshot() != self.core.cur_tx().load(Ordering::Acquire) {
                return Ok(false);
            }
            if opv == 0 {
                continue;
            }
            let tf = unsafe { &*(opv as usize as *const TransFn) };
            let r = match (tf.func)(tx) {
                Ok(r) => r,
                Err(TxError::Aborted) => return Err(TxError::Aborted),
                Err(e) if i == tx.tid() => return Err(e),
                Err(_) => return Err(TxError::Aborted),
            };
            let res_cell =
                unsafe { &*(&self.results[i].0 as *const TaggedWord as *const TmCell<u64>) };
            tx.store(res_cell, r);
        }
        Ok(true)
    }

    fn retire_func(&self, tid: usize, funcptr: *mut TransFn, first_era: u64) {
        let mut tf = unsafe { Box::from_raw(funcptr) };
        tf.new_era = first_era;
        // One past the current sequence, so helpers racing on the tail end
        // of this transaction stay covered
        tf.del_era = self.core.current_seq() + 1;
        self.he.retire(tf, tid);
    }
}

impl Ptm for OneFileWf {
    type WriteTx = OfTx;
    type ReadTx = OfTx;

    fn update_tx<F>(&self, f: F) -> Result<(), TxError>
    where
        F: Fn(&mut OfTx) -> Result<(), TxError> + Send + Sync + 'static,
    {
        OneFileWf::update_tx::<(), F>(self, f)
    }

    fn read_tx<F>(&self, f: F) -> Result<(), TxError>
    where
        F: Fn(&mut OfTx) -> Result<(), TxError> + Send + Sync + 'static,
    {
        OneFileWf::read_tx::<(), F>(self, f)
    }
}
