// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The twin-region core shared by both Romulus variants: region layout and
//! creation, the `IDLE`/`MUTATING`/`COPYING` state machine with its
//! recovery, log replay, and the transaction handles.
//!
//! Layout of the mapped file:
//!
//! ```text
//! | header | main (half of the rest) | back (same size) |
//! ```
//!
//! Invariants: `state == IDLE` implies `main == back` over the used range;
//! under `MUTATING` recovery restores `main` from `back`; under `COPYING`
//! recovery restores `back` from `main`.

use crate::persist::Persist;
use crate::rlog::RangeLog;
use core::mem::size_of;
use core::ptr;
use core::sync::atomic::{AtomicU64, Ordering};
use std::cell::UnsafeCell;
use stronghold_ptm::{EsLoco, NvmFence, PmemConfig, PmemRegion};

pub(crate) const IDLE: u64 = 0;
pub(crate) const MUTATING: u64 = 1;
pub(crate) const COPYING: u64 = 2;

/// Slots in the persistent object directory.
pub const MAX_ROOT_POINTERS: usize = 100;

// Reserved bytes ahead of 'main'; the header itself is much smaller.
const HEADER_SIZE: usize = 128;

/// Lives at the very start of the mapped file. `used_size` has to be kept
/// current so recovery and the full-copy fallback know how many bytes
/// matter.
#[repr(C)]
struct PersistentHeader {
    id: u64,
    state: AtomicU64,
    // Absolute address of the root directory, allocated inside 'main'
    objects: u64,
    used_size: u64,
}

pub struct Twin {
    region: PmemRegion,
    pub(crate) fences: &'static dyn NvmFence,
    magic: u64,
    per: *mut PersistentHeader,
    pub(crate) main_addr: usize,
    pub(crate) back_addr: usize,
    pub(crate) main_size: usize,
    // Mutated only by the single active writer (or during creation)
    log: UnsafeCell<RangeLog>,
    esloco: EsLoco<Persist<u64>, RomTx>,
}

unsafe impl Send for Twin {}
unsafe impl Sync for Twin {}

impl Twin {
    pub(crate) fn new(cfg: PmemConfig, magic: u64) -> Self {
        assert!(
            cfg.region_size > 4 * HEADER_SIZE,
            "persistent region too small"
        );
        let region = PmemRegion::map(&cfg.file_path, cfg.map_addr, cfg.region_size);
        let per = region.base() as *mut PersistentHeader;
        let main_addr = region.base() as usize + HEADER_SIZE;
        let main_size = (region.len() - HEADER_SIZE) / 2;
        let back_addr = main_addr + main_size;

        let reuse = !region.is_new() && unsafe { ptr::addr_of!((*per).id).read() } == magic;
        let esloco = EsLoco::new(main_addr, main_size, !reuse);
        let twin = Self {
            region,
            fences: cfg.fences,
            magic,
            per,
            main_addr,
            back_addr,
            main_size,
            log: UnsafeCell::new(RangeLog::new()),
            esloco,
        };
        if reuse {
            log::info!("romulus: re-using persistent region, running recovery");
            twin.recover();
        } else {
            twin.create();
        }
        twin
    }

    /// First-time layout of a fresh (or unrecognizable) region. Runs one
    /// synthetic transaction with logging off and `used_size` pinned to the
    /// whole of `main`, so the commit replicates every byte into `back`.
    fn create(&self) {
        unsafe { ptr::write_bytes(self.per as *mut u8, 0, HEADER_SIZE) };
        self.fences.pwb(unsafe { ptr::addr_of!((*self.per).id) } as *const u8);
        self.fences.pwb(self.state() as *const AtomicU64 as *const u8);

        self.begin_mutating();
        unsafe { ptr::addr_of_mut!((*self.per).used_size).write(self.main_size as u64) };
        {
            let wlog = unsafe { &mut *self.log.get() };
            wlog.set_enabled(false);
        }
        let mut tx = RomTx::new(self);
        let objects = self
            .esloco
            .malloc((MAX_ROOT_POINTERS * size_of::<Persist<u64>>()) as u64, &mut tx)
            .expect("allocating the object directory cannot abort");
        assert_ne!(objects, 0, "region too small for the object directory");
        unsafe { ptr::addr_of_mut!((*self.per).objects).write(objects) };
        for idx in 0..MAX_ROOT_POINTERS {
            let slot = self.root_slot(idx);
            tx.store(slot, 0u64);
            self.fences.pwb(slot as *const Persist<u64> as *const u8);
        }
        self.persist_main();
        self.replicate();

        // The real high-water mark, now that the full copy is done
        let used = self
            .esloco
            .used_size(&mut tx)
            .expect("reading the allocator top cannot abort")
            + HEADER_SIZE as u64;
        unsafe { ptr::addr_of_mut!((*self.per).used_size).write(used) };
        self.fences
            .flush_range(self.per as *const u8, size_of::<PersistentHeader>());
        self.fences.pfence();
        // Magic last: it confirms the whole initialization completed
        unsafe { ptr::addr_of_mut!((*self.per).id).write(self.magic) };
        self.fences.pwb(unsafe { ptr::addr_of!((*self.per).id) } as *const u8);
        self.fences.psync();
    }

    /// Re-initializes the region in place. Only callable while quiesced.
    pub(crate) fn reset(&self) {
        unsafe {
            ptr::write_bytes(self.region.base(), 0, self.region.len());
        }
        let _ = EsLoco::<Persist<u64>, RomTx>::new(self.main_addr, self.main_size, true);
        unsafe { (&mut *self.log.get()).clear() };
        self.create();
    }

    /// Resolves an interrupted transaction according to the state machine.
    /// Idempotent: after one pass the state is `IDLE` and further passes do
    /// nothing.
    pub(crate) fn recover(&self) {
        match self.state().load(Ordering::Relaxed) {
            IDLE => return,
            COPYING => {
                log::warn!("romulus: recovery from COPYING, replicating main");
                self.copy_main_to_back();
            }
            MUTATING => {
                log::warn!("romulus: recovery from MUTATING, rolling back main");
                self.copy_back_to_main();
            }
            other => panic!("romulus: corrupted recovery state {}", other),
        }
        self.fences.pfence();
        self.state().store(IDLE, Ordering::Relaxed);
    }

    pub(crate) fn state(&self) -> &AtomicU64 {
        unsafe { &(*self.per).state }
    }

    pub(crate) fn used_size(&self) -> u64 {
        unsafe { ptr::addr_of!((*self.per).used_size).read() }
    }

    pub(crate) fn in_main(&self, addr: usize) -> bool {
        addr >= self.main_addr && addr < self.main_addr + self.main_size
    }

    pub(crate) fn root_slot(&self, idx: usize) -> &Persist<u64> {
        assert!(idx < MAX_ROOT_POINTERS, "root pointer index out of range");
        let objects = unsafe { ptr::addr_of!((*self.per).objects).read() } as usize;
        unsafe { &*((objects + idx * size_of::<Persist<u64>>()) as *const Persist<u64>) }
    }

    pub(crate) fn log_store(&self, addr: usize, length: usize) {
        let used = self.used_size() as usize;
        let wlog = unsafe { &mut *self.log.get() };
        wlog.add(addr, length, self.main_addr, used);
    }

    pub(crate) fn bump_used(&self, obj_addr: usize, obj_size: usize) {
        let need = (obj_addr - self.main_addr + obj_size + HEADER_SIZE) as u64;
        unsafe {
            if ptr::addr_of!((*self.per).used_size).read() < need {
                ptr::addr_of_mut!((*self.per).used_size).write(need);
                self.fences
                    .pwb(ptr::addr_of!((*self.per).used_size) as *const u8);
            }
        }
    }

    pub(crate) fn esloco(&self) -> &EsLoco<Persist<u64>, RomTx> {
        &self.esloco
    }

    /// Opens a write transaction: once `MUTATING` is persistent, a crash
    /// rolls `main` back from `back`.
    pub(crate) fn begin_mutating(&self) {
        self.state().store(MUTATING, Ordering::Relaxed);
        self.fences.pwb(self.state() as *const AtomicU64 as *const u8);
        // One fence covers all user stores; they need no order among
        // themselves
        self.fences.pfence();
    }

    /// Flushes the mutated ranges of `main` and moves to `COPYING`. The
    /// `psync` is the durability point of the transaction.
    pub(crate) fn persist_main(&self) {
        self.apply_pwb(self.main_addr);
        self.fences.pfence();
        self.state().store(COPYING, Ordering::Relaxed);
        self.fences.pwb(self.state() as *const AtomicU64 as *const u8);
        self.fences
            .pwb(unsafe { ptr::addr_of!((*self.per).used_size) } as *const u8);
        self.fences.psync();
    }

    /// Replays the log onto `back` (or falls back to a full copy when the
    /// log gave up), clears it and returns to `IDLE`.
    pub(crate) fn replicate(&self) {
        let enabled = unsafe { (&*self.log.get()).is_enabled() };
        if enabled {
            self.apply_log(self.main_addr, self.back_addr);
            self.apply_pwb(self.back_addr);
        } else {
            self.copy_main_to_back();
            unsafe { (&mut *self.log.get()).set_enabled(true) };
        }
        unsafe { (&mut *self.log.get()).clear() };
        self.fences.pfence();
        self.state().store(IDLE, Ordering::Relaxed);
    }

    fn apply_log(&self, from: usize, to: usize) {
        let wlog = unsafe { &*self.log.get() };
        for e in wlog.iter() {
            unsafe {
                ptr::copy_nonoverlapping(
                    (from + e.offset) as *const u8,
                    (to + e.offset) as *mut u8,
                    e.length,
                );
            }
        }
    }

    fn apply_pwb(&self, from: usize) {
        let wlog = unsafe { &*self.log.get() };
        for e in wlog.iter() {
            self.fences
                .flush_range((from + e.offset) as *const u8, e.length);
        }
    }

    pub(crate) fn copy_main_to_back(&self) {
        let size = self.used_size().min(self.main_size as u64) as usize;
        unsafe {
            ptr::copy_nonoverlapping(
                self.main_addr as *const u8,
                self.back_addr as *mut u8,
                size,
            );
        }
        self.fences.flush_range(self.back_addr as *const u8, size);
    }

    pub(crate) fn copy_back_to_main(&self) {
        let size = self.used_size().min(self.main_size as u64) as usize;
        unsafe {
            ptr::copy_nonoverlapping(
                self.back_addr as *const u8,
                self.main_addr as *mut u8,
                size,
            );
        }
        self.fences.flush_range(self.main_addr as *const u8, size);
    }

    /// Byte comparison of the two regions; only meaningful while no write
    /// transaction is running.
    pub(crate) fn compare_main_and_back(&self) -> bool {
        let a = unsafe { std::slice::from_raw_parts(self.main_addr as *const u8, self.main_size) };
        let b = unsafe { std::slice::from_raw_parts(self.back_addr as *const u8, self.main_size) };
        if a != b {
            let diff = a
                .iter()
                .zip(b.iter())
                .filter(|(x, y)| x != y)
                .count();
            log::error!(
                "romulus: main and back differ in {} bytes; a store is missing its persist<> wrapper",
                diff
            );
            return false;
        }
        true
    }
}

/// Write-transaction handle. Constructed by the engine once it owns the
/// writer lane; all mutations of `main` flow through it.
pub struct RomTx {
    twin: *const Twin,
}

impl RomTx {
    pub(crate) fn new(twin: &Twin) -> Self {
        Self { twin }
    }

    fn twin<'a>(&self) -> &'a Twin {
        unsafe { &*self.twin }
    }

    pub fn load<T: Copy>(&mut self, cell: &Persist<T>) -> T {
        cell.read_direct()
    }

    /// Stores in place and logs the mutated range when it falls inside
    /// `main`.
    pub fn store<T: Copy>(&mut self, cell: &Persist<T>, v: T) {
        unsafe { cell.write_direct(v) };
        let addr = cell as *const Persist<T> as usize;
        let twin = self.twin();
        if twin.in_main(addr) {
            twin.log_store(addr, size_of::<T>());
        }
    }

    /// Allocates room for a `T` in the persistent heap; null when the heap
    /// is exhausted.
    pub fn alloc<T>(&mut self) -> *mut T {
        let twin = self.twin();
        match twin.esloco().malloc(size_of::<T>() as u64, self) {
            Ok(0) | Err(_) => {
                log::error!("romulus: out of transactional memory");
                ptr::null_mut()
            }
            Ok(addr) => {
                twin.bump_used(addr as usize, size_of::<T>());
                addr as usize as *mut T
            }
        }
    }

    pub fn dealloc<T>(&mut self, obj: *mut T) {
        if obj.is_null() {
            return;
        }
        let twin = self.twin();
        let _ = twin.esloco().free(obj as usize as u64, self);
    }

    pub fn pmalloc(&mut self, size: usize) -> *mut u8 {
        let twin = self.twin();
        match twin.esloco().malloc(size as u64, self) {
            Ok(0) | Err(_) => ptr::null_mut(),
            Ok(addr) => {
                twin.bump_used(addr as usize, size);
                addr as usize as *mut u8
            }
        }
    }

    pub fn pfree(&mut self, obj: *mut u8) {
        self.dealloc(obj);
    }

    pub fn get_root<T>(&mut self, idx: usize) -> *mut T {
        let slot = self.twin().root_slot(idx);
        let v = self.load(slot);
        v as usize as *mut T
    }

    pub fn put_root<T>(&mut self, idx: usize, obj: *mut T) {
        let twin = self.twin();
        let slot = twin.root_slot(idx);
        self.store(slot, obj as usize as u64);
        twin.fences.pwb(slot as *const Persist<u64> as *const u8);
    }
}

/// Read-transaction handle. Under the Left-Right lane it may be routed to
/// the `back` copy, in which case every address inside `main` is offset by
/// the region size; the layout of both copies is identical by
/// construction.
pub struct RomRead {
    twin: *const Twin,
    side_right: bool,
}

impl RomRead {
    pub(crate) fn new(twin: &Twin, side_right: bool) -> Self {
        Self { twin, side_right }
    }

    fn twin<'a>(&self) -> &'a Twin {
        unsafe { &*self.twin }
    }

    pub fn load<T: Copy>(&self, cell: &Persist<T>) -> T {
        let twin = self.twin();
        let addr = cell as *const Persist<T> as usize;
        if self.side_right && twin.in_main(addr) {
            unsafe { ((addr + twin.main_size) as *const T).read() }
        } else {
            cell.read_direct()
        }
    }

    pub fn get_root<T>(&self, idx: usize) -> *mut T {
        let twin = self.twin();
        let slot = twin.root_slot(idx);
        let v: u64 = self.load(slot);
        v as usize as *mut T
    }
}
