// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The Romulus cell type. A `Persist<T>` stores its value in place inside
//! the `main` region; transactional stores additionally append the byte
//! range to the write log so commit can mirror it into `back`. Loads are
//! plain reads, except under a Left-Right reader routed to the `back` copy,
//! which the read handle resolves by offsetting the address.

use crate::twin::RomTx;
use core::cell::UnsafeCell;
use stronghold_ptm::{TxCell, TxError};

#[repr(transparent)]
pub struct Persist<T> {
    val: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Persist<T> {}
unsafe impl<T: Send> Sync for Persist<T> {}

impl<T: Copy> Persist<T> {
    /// Plain read of the in-place value. Inside transactions prefer the
    /// handle methods, which pick the correct region copy.
    pub fn read_direct(&self) -> T {
        unsafe { self.val.get().read() }
    }

    pub(crate) unsafe fn write_direct(&self, v: T) {
        self.val.get().write(v)
    }
}

// The allocator metadata uses u64 cells whose stores are logged like any
// other transactional store.
impl TxCell<RomTx> for Persist<u64> {
    fn load(&self, tx: &mut RomTx) -> Result<u64, TxError> {
        Ok(tx.load(self))
    }

    fn store(&self, tx: &mut RomTx, v: u64) -> Result<(), TxError> {
        tx.store(self, v);
        Ok(())
    }

    fn init(&self, v: u64) {
        unsafe { self.write_direct(v) }
    }
}
