// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Stronghold PTM infrastructure
//!
//! This crate holds the pieces shared by the persistent transactional memory
//! engines: the process-wide thread registry, the distributed read indicator,
//! the C-RW-WP reader-writer lock, hazard pointers and hazard eras for safe
//! reclamation, the persistence fences (PWB/PFENCE/PSYNC), the fixed-address
//! persistent region mapping and the EsLoco pool allocator that lives inside
//! a mapped region.
//!
//! None of these types starts a transaction on its own; the engines in the
//! sibling crates drive them.
#![allow(clippy::missing_safety_doc)]

pub mod api;
pub mod error;
pub mod esloco;
pub mod flush;
pub mod hp;
pub mod indicator;
pub mod pad;
pub mod region;
pub mod registry;
pub mod rwlock;

pub mod eras;

pub use api::Ptm;
pub use error::TxError;
pub use esloco::{EsLoco, TxCell};
pub use flush::{ClflushFence, NoFence, NvmFence, CLFLUSH_FENCE, NO_FENCE};
pub use hp::HazardPointers;
pub use indicator::ReadIndicator;
pub use pad::CacheAligned;
pub use region::{PmemConfig, PmemRegion};
pub use rwlock::{CrwwpLock, SpinLock};

pub use eras::{EraTracked, HazardEras, NO_ERA};
