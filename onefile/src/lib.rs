// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # OneFile persistent transactional memory
//!
//! A word-based PTM built on double-width compare-and-swap. Every
//! transactional word is a `(value, sequence)` pair updated by a single
//! 16-byte CAS; a committing writer publishes its redo log, installs the new
//! transaction identifier with one CAS and then applies the log word by
//! word, with every other thread able to help finish the application.
//!
//! Two engines share that core:
//! - [`OneFileLf`]: lock-free begin/commit driver.
//! - [`OneFileWf`]: wait-free; transactions are announced as heap-allocated
//!   closures which committing writers execute on behalf of slow threads,
//!   with hazard-era reclamation of the retired closures.
#![allow(clippy::missing_safety_doc)]

pub mod cell;
pub mod engine;
pub mod lf;
pub mod wf;
pub mod word;
pub mod wset;

pub use engine::{OfTx, MAX_ROOT_POINTERS};
pub use cell::{TmCell, TmValue};
pub use lf::OneFileLf;
pub use wf::OneFileWf;
pub use word::TaggedWord;

/// Default size of the mapped persistent region.
pub const PM_REGION_SIZE: usize = 400 * 1024 * 1024;
