// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error as DeriveError;

/// Errors surfaced by transactional operations.
///
/// [`TxError::Aborted`] is the internal retry sentinel: a transactional load
/// observed a word written by a newer commit. It is produced by the cell
/// load paths and consumed by the engine driver loops; user code only has to
/// propagate it with `?`.
#[derive(Debug, DeriveError, PartialEq, Eq)]
pub enum TxError {
    #[error("transaction aborted on a stale read")]
    Aborted,

    #[error("inner error occured ({0})")]
    Inner(String),
}
