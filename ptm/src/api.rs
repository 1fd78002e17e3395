// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The operation set shared by every engine. The bounds are the common
//! denominator the wait-free engine needs (its closures are announced and
//! may be executed by helper threads), so generic code written against
//! [`Ptm`] runs unchanged on all engines. Engine-specific entry points with
//! looser bounds or typed return values stay inherent on each engine.

use crate::error::TxError;

pub trait Ptm {
    /// Handle passed to mutating transaction bodies.
    type WriteTx;
    /// Handle passed to read-only transaction bodies.
    type ReadTx;

    /// Runs `f` as an atomic, durable transaction.
    fn update_tx<F>(&self, f: F) -> Result<(), TxError>
    where
        F: Fn(&mut Self::WriteTx) -> Result<(), TxError> + Send + Sync + 'static;

    /// Runs `f` as a read-only transaction.
    fn read_tx<F>(&self, f: F) -> Result<(), TxError>
    where
        F: Fn(&mut Self::ReadTx) -> Result<(), TxError> + Send + Sync + 'static;
}
