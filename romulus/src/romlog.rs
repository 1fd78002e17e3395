// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The flat-combining Romulus variant. Writers publish their operation in a
//! per-thread slot and race for the C-RW-WP lock; whoever wins drains the
//! readers, executes every queued operation under a single transaction and
//! release-clears the slots so the other writers observe completion without
//! ever taking the lock. Readers run under the shared side of the lock.

use crate::twin::{RomRead, RomTx, Twin};
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use stronghold_ptm::registry::{self, MAX_THREADS};
use stronghold_ptm::{CacheAligned, CrwwpLock, Ptm, PmemConfig, TxError};

const MAGIC: u64 = 0x1337_bab2;

// A queued operation: caller-stack closure behind a thin shim pointer.
struct FcOp {
    run: unsafe fn(*mut (), &mut RomTx),
    data: *mut (),
}

pub struct RomulusLog {
    twin: Twin,
    rwlock: CrwwpLock,
    fc: Box<[CacheAligned<AtomicPtr<FcOp>>]>,
    // Owner-indexed nesting depths; only thread tid touches slot tid.
    nested_write: Box<[CacheAligned<AtomicU64>]>,
    nested_read: Box<[CacheAligned<AtomicU64>]>,
}

impl RomulusLog {
    pub fn new(cfg: PmemConfig) -> Self {
        let fc = (0..MAX_THREADS)
            .map(|_| CacheAligned::new(AtomicPtr::new(ptr::null_mut())))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let nested_write = (0..MAX_THREADS)
            .map(|_| CacheAligned::new(AtomicU64::new(0)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let nested_read = (0..MAX_THREADS)
            .map(|_| CacheAligned::new(AtomicU64::new(0)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            twin: Twin::new(cfg, MAGIC),
            rwlock: CrwwpLock::new(),
            fc,
            nested_write,
            nested_read,
        }
    }

    pub fn default_config() -> PmemConfig {
        PmemConfig::new(
            "/dev/shm/romulus_log_shared",
            0x7fdd_4000_0000,
            crate::PM_REGION_SIZE,
        )
    }

    /// Runs `f` as a durable write transaction. The closure may be executed
    /// by another thread (the combiner) while the caller spins on its slot.
    ///
    /// Progress: blocking (starvation-free through combining).
    pub fn update_tx<F>(&self, mut f: F)
    where
        F: FnMut(&mut RomTx) + Send,
    {
        let tid = registry::get_tid();
        if self.nested_write[tid].load(Ordering::Relaxed) > 0 {
            let mut tx = RomTx::new(&self.twin);
            f(&mut tx);
            return;
        }

        unsafe fn shim<F: FnMut(&mut RomTx)>(data: *mut (), tx: &mut RomTx) {
            (*(data as *mut F))(tx)
        }
        let mut op = FcOp {
            run: shim::<F>,
            data: &mut f as *mut F as *mut (),
        };
        self.fc[tid].store(&mut op as *mut FcOp, Ordering::Release);

        loop {
            if self.rwlock.try_exclusive_lock() {
                break;
            }
            // Another combiner may have executed our operation already
            if self.fc[tid].load(Ordering::Acquire).is_null() {
                return;
            }
            std::thread::yield_now();
        }

        let max_tid = registry::max_threads();
        let lfc: Vec<*mut FcOp> = (0..max_tid)
            .map(|i| self.fc[i].load(Ordering::Acquire))
            .collect();
        if lfc.iter().all(|p| p.is_null()) {
            self.rwlock.exclusive_unlock();
            return;
        }

        self.twin.begin_mutating();
        self.rwlock.wait_for_readers();

        self.nested_write[tid].store(1, Ordering::Relaxed);
        let mut tx = RomTx::new(&self.twin);
        for p in lfc.iter().copied() {
            if p.is_null() {
                continue;
            }
            unsafe { ((*p).run)((*p).data, &mut tx) };
        }
        self.twin.persist_main();
        // Durable from here: release the threads whose operations ran
        for (i, p) in lfc.iter().enumerate() {
            if !p.is_null() {
                self.fc[i].store(ptr::null_mut(), Ordering::Release);
            }
        }
        self.twin.replicate();
        self.rwlock.exclusive_unlock();
        self.nested_write[tid].store(0, Ordering::Relaxed);
    }

    /// Read-only transaction under the shared lock.
    pub fn read_tx<R, F>(&self, mut f: F) -> R
    where
        F: FnMut(&mut RomRead) -> R,
    {
        let tid = registry::get_tid();
        if self.nested_read[tid].load(Ordering::Relaxed) > 0 {
            let mut guard = RomRead::new(&self.twin, false);
            return f(&mut guard);
        }
        self.nested_read[tid].store(1, Ordering::Relaxed);
        self.rwlock.shared_lock(tid);
        let mut guard = RomRead::new(&self.twin, false);
        let r = f(&mut guard);
        self.rwlock.shared_unlock(tid);
        self.nested_read[tid].store(0, Ordering::Relaxed);
        r
    }

    /// Compares `main` and `back` byte for byte. Must not be called inside
    /// a transaction.
    pub fn consistency_check(&self) -> bool {
        while !self.rwlock.try_exclusive_lock() {
            std::thread::yield_now();
        }
        self.rwlock.wait_for_readers();
        let ok = self.twin.compare_main_and_back();
        self.rwlock.exclusive_unlock();
        ok
    }

    /// Re-initializes the region. Callers must guarantee quiescence.
    pub fn reset(&self) {
        while !self.rwlock.try_exclusive_lock() {
            std::thread::yield_now();
        }
        self.rwlock.wait_for_readers();
        self.twin.reset();
        self.rwlock.exclusive_unlock();
    }

    #[cfg(test)]
    pub(crate) fn twin(&self) -> &Twin {
        &self.twin
    }
}

impl Ptm for RomulusLog {
    type WriteTx = RomTx;
    type ReadTx = RomRead;

    fn update_tx<F>(&self, f: F) -> Result<(), TxError>
    where
        F: Fn(&mut RomTx) -> Result<(), TxError> + Send + Sync + 'static,
    {
        let mut out = Ok(());
        RomulusLog::update_tx(self, |tx| out = f(tx));
        out
    }

    fn read_tx<F>(&self, f: F) -> Result<(), TxError>
    where
        F: Fn(&mut RomRead) -> Result<(), TxError> + Send + Sync + 'static,
    {
        let mut out = Ok(());
        RomulusLog::read_tx(self, |guard| out = f(guard));
        out
    }
}
