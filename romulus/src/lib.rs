// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Romulus persistent transactional memory
//!
//! Romulus keeps two byte-identical copies of the transactional heap,
//! `main` and `back`, inside one mapped file. A write transaction mutates
//! `main` in place while appending `{offset, length}` ranges to a volatile
//! log; commit flushes the mutated ranges, flips a persistent state word to
//! `COPYING` (the durability point) and replays the log onto `back`. A
//! crash at any point resolves by copying whole regions in the direction
//! the state word dictates.
//!
//! Two writer lanes share that core:
//! - [`RomulusLog`]: writers serialize on a C-RW-WP lock and batch queued
//!   operations flat-combining style; readers take the shared lock.
//! - [`RomulusLr`]: a Left-Right lane where readers never block writers.
//!   Readers announce themselves on one of two read indicators and read
//!   whichever region the `left_right` switch points at.
#![allow(clippy::missing_safety_doc)]

pub mod lr;
pub mod persist;
pub mod rlog;
pub mod romlog;
pub mod twin;

pub use lr::RomulusLr;
pub use persist::Persist;
pub use romlog::RomulusLog;
pub use twin::{RomRead, RomTx, MAX_ROOT_POINTERS};

/// Default size of the mapped persistent region (holds both copies).
pub const PM_REGION_SIZE: usize = 400 * 1024 * 1024;
