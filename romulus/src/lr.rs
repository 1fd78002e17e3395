// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The Left-Right Romulus variant. Readers never block writers and writers
//! never block readers: while a writer mutates `main` (the left copy),
//! readers are routed to `back` (the right copy), and the switch-over in
//! each direction is an RCU-style toggle of the version index followed by
//! draining the previous side's read indicator.

use crate::twin::{RomRead, RomTx, Twin};
use core::hint;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use stronghold_ptm::registry::{self, MAX_THREADS};
use stronghold_ptm::{CacheAligned, Ptm, PmemConfig, ReadIndicator, TxError};

const MAGIC: u64 = 0x1337_bab5;

const UNLOCKED: u64 = 0;
const LOCKED: u64 = 1;

const TRAVERSE_LEFT: u64 = 0;
const TRAVERSE_RIGHT: u64 = 1;

struct FcOp {
    run: unsafe fn(*mut (), &mut RomTx),
    data: *mut (),
}

pub struct RomulusLr {
    twin: Twin,
    fc: Box<[CacheAligned<AtomicPtr<FcOp>>]>,
    writers_mutex: CacheAligned<AtomicU64>,
    left_right: CacheAligned<AtomicU64>,
    version_index: CacheAligned<AtomicU64>,
    ri: [ReadIndicator; 2],
    // Owner-indexed: the side an outer reader resolved, for nested reads
    reader_side: Box<[CacheAligned<AtomicU64>]>,
    nested_write: Box<[CacheAligned<AtomicU64>]>,
    nested_read: Box<[CacheAligned<AtomicU64>]>,
}

impl RomulusLr {
    pub fn new(cfg: PmemConfig) -> Self {
        let per_thread =
            || -> Box<[CacheAligned<AtomicU64>]> {
                (0..MAX_THREADS)
                    .map(|_| CacheAligned::new(AtomicU64::new(0)))
                    .collect::<Vec<_>>()
                    .into_boxed_slice()
            };
        let fc = (0..MAX_THREADS)
            .map(|_| CacheAligned::new(AtomicPtr::new(ptr::null_mut())))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            twin: Twin::new(cfg, MAGIC),
            fc,
            writers_mutex: CacheAligned::new(AtomicU64::new(UNLOCKED)),
            left_right: CacheAligned::new(AtomicU64::new(TRAVERSE_LEFT)),
            version_index: CacheAligned::new(AtomicU64::new(0)),
            ri: [ReadIndicator::new(), ReadIndicator::new()],
            reader_side: per_thread(),
            nested_write: per_thread(),
            nested_read: per_thread(),
        }
    }

    pub fn default_config() -> PmemConfig {
        PmemConfig::new(
            "/dev/shm/romulus_lr_shared",
            0x7fde_0000_0000,
            crate::PM_REGION_SIZE,
        )
    }

    /// synchronize_rcu(): flips the version index and waits until every
    /// reader that arrived under the previous index departed.
    fn toggle_version_and_wait(&self) {
        let local_vi = self.version_index.load(Ordering::SeqCst);
        let prev_vi = (local_vi & 1) as usize;
        let next_vi = ((local_vi + 1) & 1) as usize;
        while !self.ri[next_vi].is_empty() {
            hint::spin_loop();
        }
        self.version_index.store(next_vi as u64, Ordering::SeqCst);
        while !self.ri[prev_vi].is_empty() {
            hint::spin_loop();
        }
    }

    /// Durable write transaction; flat combining over a CAS writer mutex.
    /// Readers keep running on the opposite side the whole time.
    ///
    /// Progress: blocking for writers, wait-free for concurrent readers.
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
            if self.writers_mutex.load(Ordering::SeqCst) == UNLOCKED
                && self
                    .writers_mutex
                    .compare_exchange(UNLOCKED, LOCKED, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                break;
            }
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
            self.writers_mutex.store(UNLOCKED, Ordering::Release);
            return;
        }

        self.nested_write[tid].store(1, Ordering::Relaxed);
        self.twin.begin_mutating();
        // Route readers to the untouched right copy while main mutates
        self.left_right.store(TRAVERSE_RIGHT, Ordering::SeqCst);
        self.toggle_version_and_wait();

        let mut tx = RomTx::new(&self.twin);
        for p in lfc.iter().copied() {
            if p.is_null() {
                continue;
            }
            unsafe { ((*p).run)((*p).data, &mut tx) };
        }
        self.twin.persist_main();
        // Mutations on main are durable; bring the readers back before
        // touching the right copy
        self.left_right.store(TRAVERSE_LEFT, Ordering::SeqCst);
        self.toggle_version_and_wait();

        for (i, p) in lfc.iter().enumerate() {
            if !p.is_null() {
                self.fc[i].store(ptr::null_mut(), Ordering::Release);
            }
        }
        self.twin.replicate();
        self.writers_mutex.store(UNLOCKED, Ordering::Release);
        self.nested_write[tid].store(0, Ordering::Relaxed);
    }

    /// Read-only transaction.
    ///
    /// Progress: wait-free population oblivious.
    pub fn read_tx<R, F>(&self, mut f: F) -> R
    where
        F: FnMut(&mut RomRead) -> R,
    {
        let tid = registry::get_tid();
        if self.nested_read[tid].load(Ordering::Relaxed) > 0 {
            let side = self.reader_side[tid].load(Ordering::Relaxed) == TRAVERSE_RIGHT;
            let mut guard = RomRead::new(&self.twin, side);
            return f(&mut guard);
        }
        self.nested_read[tid].store(1, Ordering::Relaxed);
        let vi = (self.version_index.load(Ordering::SeqCst) & 1) as usize;
        self.ri[vi].arrive(tid);
        let lr = self.left_right.load(Ordering::SeqCst);
        self.reader_side[tid].store(lr, Ordering::Relaxed);
        let mut guard = RomRead::new(&self.twin, lr == TRAVERSE_RIGHT);
        let r = f(&mut guard);
        self.ri[vi].depart(tid);
        self.nested_read[tid].store(0, Ordering::Relaxed);
        r
    }

    /// Compares `main` and `back` byte for byte; must run quiesced.
    pub fn consistency_check(&self) -> bool {
        loop {
            if self.writers_mutex.load(Ordering::SeqCst) == UNLOCKED
                && self
                    .writers_mutex
                    .compare_exchange(UNLOCKED, LOCKED, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                break;
            }
            std::thread::yield_now();
        }
        let ok = self.twin.compare_main_and_back();
        self.writers_mutex.store(UNLOCKED, Ordering::Release);
        ok
    }

    #[cfg(test)]
    pub(crate) fn twin(&self) -> &Twin {
        &self.twin
    }
}

impl Ptm for RomulusLr {
    type WriteTx = RomTx;
    type ReadTx = RomRead;

    fn update_tx<F>(&self, f: F) -> Result<(), TxError>
    where
        F: Fn(&mut RomTx) -> Result<(), TxError> + Send + Sync + 'static,
    {
        let mut out = Ok(());
        RomulusLr::update_tx(self, |tx| out = f(tx));
        out
    }

    fn read_tx<F>(&self, f: F) -> Result<(), TxError>
    where
        F: Fn(&mut RomRead) -> Result<(), TxError> + Send + Sync + 'static,
    {
        let mut out = Ok(());
        RomulusLr::read_tx(self, |guard| out = f(guard));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::Persist;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Arc;
    use std::thread;
    use stronghold_ptm::NO_FENCE;

    const BASE_ADDR: usize = 0x7a40_0000_0000;
    const SPACING: usize = 0x0800_0000;
    const REGION_SIZE: usize = 8 * 1024 * 1024;

    static NEXT_SLOT: AtomicUsize = AtomicUsize::new(0);

    fn fresh_config(dir: &tempfile::TempDir, name: &str) -> PmemConfig {
        let slot = NEXT_SLOT.fetch_add(1, Ordering::SeqCst);
        PmemConfig::new(dir.path().join(name), BASE_ADDR + slot * SPACING, REGION_SIZE)
            .with_fences(&NO_FENCE)
    }

    #[repr(C)]
    struct Pair {
        a: Persist<u64>,
        b: Persist<u64>,
    }

    #[test]
    fn test_lr_counter() {
        let dir = tempfile::tempdir().unwrap();
        let tm = RomulusLr::new(fresh_config(&dir, "lr_counter.pool"));
        tm.update_tx(|tx| {
            let c: *mut Persist<u64> = tx.alloc();
            assert!(!c.is_null());
            unsafe { tx.store(&*c, 0u64) };
            tx.put_root(0, c);
        });
        for _ in 0..10 {
            tm.update_tx(|tx| {
                let c: *mut Persist<u64> = tx.get_root(0);
                unsafe {
                    let v = tx.load(&*c);
                    tx.store(&*c, v + 1);
                }
            });
        }
        let v = tm.read_tx(|guard| {
            let c: *mut Persist<u64> = guard.get_root(0);
            unsafe { guard.load(&*c) }
        });
        assert_eq!(v, 10);
        assert!(tm.consistency_check());
    }

    #[test]
    fn test_lr_readers_never_observe_partial_writes() {
        const SUM: u64 = 100;

        let dir = tempfile::tempdir().unwrap();
        let tm = Arc::new(RomulusLr::new(fresh_config(&dir, "lr_isolation.pool")));
        tm.update_tx(|tx| {
            let p: *mut Pair = tx.alloc();
            assert!(!p.is_null());
            unsafe {
                tx.store(&(*p).a, SUM);
                tx.store(&(*p).b, 0u64);
            }
            tx.put_root(0, p);
        });

        let stop = Arc::new(AtomicBool::new(false));
        let writer = {
            let tm = tm.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                for i in 0..200u64 {
                    let shift = i % SUM;
                    tm.update_tx(move |tx| {
                        let p: *mut Pair = tx.get_root(0);
                        unsafe {
                            tx.store(&(*p).a, SUM - shift);
                            tx.store(&(*p).b, shift);
                        }
                    });
                }
                stop.store(true, Ordering::SeqCst);
            })
        };

        let mut readers = vec![];
        for _ in 0..3 {
            let tm = tm.clone();
            let stop = stop.clone();
            readers.push(thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    let (a, b) = tm.read_tx(|guard| {
                        let p: *mut Pair = guard.get_root(0);
                        unsafe { (guard.load(&(*p).a), guard.load(&(*p).b)) }
                    });
                    assert_eq!(a + b, SUM, "reader saw a half-applied transaction");
                }
            }));
        }

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        assert!(tm.consistency_check());
    }

    #[test]
    fn test_lr_reopen_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = fresh_config(&dir, "lr_reopen.pool");
        let (path, addr) = (cfg.file_path.clone(), cfg.map_addr);

        {
            let tm = RomulusLr::new(cfg);
            tm.update_tx(|tx| {
                let c: *mut Persist<u64> = tx.alloc();
                unsafe { tx.store(&*c, 1234u64) };
                tx.put_root(5, c);
            });
        }

        let tm = RomulusLr::new(
            PmemConfig::new(path, addr, REGION_SIZE).with_fences(&NO_FENCE),
        );
        let v = tm.read_tx(|guard| {
            let c: *mut Persist<u64> = guard.get_root(5);
            unsafe { guard.load(&*c) }
        });
        assert_eq!(v, 1234);
        assert!(tm.consistency_check());
    }
}
