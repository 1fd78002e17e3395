// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The lock-free OneFile engine. Begin and commit are lock-free: a retry
//! only happens because some other thread published a commit in between, so
//! the system as a whole always makes progress.

use crate::engine::{OfCore, OfTx};
use stronghold_ptm::{Ptm, PmemConfig, TxError};

pub struct OneFileLf {
    core: OfCore,
}

impl OneFileLf {
    pub fn new(cfg: PmemConfig) -> Self {
        Self {
            core: OfCore::new(cfg),
        }
    }

    /// The out-of-the-box mapping used when no explicit config is given.
    pub fn default_config() -> PmemConfig {
        PmemConfig::new(
            "/dev/shm/onefile_lf_shared",
            0x7fea_0000_0000,
            crate::PM_REGION_SIZE,
        )
    }

    /// Runs `f` as a mutating transaction and returns its result once the
    /// transaction commits.
    pub fn update_tx<R, F>(&self, mut f: F) -> Result<R, TxError>
    where
        F: FnMut(&mut OfTx) -> Result<R, TxError>,
    {
        self.core.transaction(&mut f)
    }

    /// Read-only transaction. Same control flow as [`OneFileLf::update_tx`];
    /// a body without stores commits without publishing anything.
    pub fn read_tx<R, F>(&self, mut f: F) -> Result<R, TxError>
    where
        F: FnMut(&mut OfTx) -> Result<R, TxError>,
    {
        self.core.transaction(&mut f)
    }

    /// Sequence number of the last committed transaction.
    pub fn current_seq(&self) -> u64 {
        self.core.current_seq()
    }
}

impl Ptm for OneFileLf {
    type WriteTx = OfTx;
    type ReadTx = OfTx;

    fn update_tx<F>(&self, f: F) -> Result<(), TxError>
    where
        F: Fn(&mut OfTx) -> Result<(), TxError> + Send + Sync + 'static,
    {
        OneFileLf::update_tx::<(), F>(self, f)
    }

    fn read_tx<F>(&self, f: F) -> Result<(), TxError>
    where
        F: Fn(&mut OfTx) -> Result<(), TxError> + Send + Sync + 'static,
    {
        OneFileLf::read_tx::<(), F>(self, f)
    }
}
