// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! EsLoco is an extremely simple memory allocator for the persistent heap.
//!
//! It keeps one intrusive free-list per power-of-two block size. Every block
//! carries a two-cell header (next pointer, size exponent) and the smallest
//! block is whatever fits the header plus two user cells. When a free-list
//! is empty a new block is carved off the top of the pool.
//!
//! Average cost per malloc is one persistent store when re-using a block;
//! free is two. All metadata lives in cells of the hosting engine
//! ([`TxCell`]), so allocator mutations are part of the enclosing
//! transaction and roll forward or disappear together with it.
//!
//! Memory layout inside the caller-provided range:
//!
//! ```text
//! | pool_top | freelists[0] ... freelists[49] | ... allocated blocks ... |
//! ```

use crate::error::TxError;
use core::marker::PhantomData;
use core::mem::size_of;

/// Cell protocol of the hosting engine. `load`/`store` run under the given
/// transaction handle; `init` is a raw store used only while the pool is
/// being laid out, before any transaction can observe it.
pub trait TxCell<Tx> {
    fn load(&self, tx: &mut Tx) -> Result<u64, TxError>;
    fn store(&self, tx: &mut Tx, v: u64) -> Result<(), TxError>;
    fn init(&self, v: u64);
}

// Exponents 2^0 .. 2^49; a petabyte-sized block is enough headroom.
const MAX_BLOCK_EXP: usize = 50;

#[repr(C)]
struct BlockHdr<C> {
    next: C,
    size: C, // exponent of the power-of-two block size in bytes
}

fn aligned(addr: usize) -> usize {
    (addr & !0x3F) + 128
}

fn highest_bit(val: u64) -> u64 {
    let mut b = 0;
    while (val >> (b + 1)) != 0 {
        b += 1;
    }
    if val > (1u64 << b) {
        b + 1
    } else {
        b
    }
}

pub struct EsLoco<C, Tx> {
    pool_addr: usize,
    pool_size: usize,
    _marker: PhantomData<fn(&mut Tx) -> C>,
}

impl<C, Tx> EsLoco<C, Tx>
where
    C: TxCell<Tx>,
{
    /// Lays the allocator over `[addr, addr + size)`. With `clear` the
    /// metadata is (re)initialized; without it the metadata already present
    /// in the range is adopted, which is the re-open path.
    pub fn new(addr: usize, size: usize, clear: bool) -> Self {
        let pool_addr = aligned(addr);
        let pool_size = size - (pool_addr - addr);
        let this = Self {
            pool_addr,
            pool_size,
            _marker: PhantomData,
        };
        if clear {
            for exp in 0..MAX_BLOCK_EXP {
                this.freelist(exp).next.init(0);
            }
            this.top_cell().init(aligned(this.metadata_end()) as u64);
        }
        log::debug!(
            "esloco pool at {:#x}, {} bytes",
            this.pool_addr,
            this.pool_size
        );
        this
    }

    /// Bytes between the pool base and the high-water mark; an upper bound
    /// on the range that may hold live objects.
    pub fn used_size(&self, tx: &mut Tx) -> Result<u64, TxError> {
        Ok(self.top_cell().load(tx)? - self.pool_addr as u64)
    }

    /// Allocates `size` bytes. Returns the address of the usable area, or 0
    /// when the pool is exhausted (out-of-memory is not a transactional
    /// failure).
    pub fn malloc(&self, size: u64, tx: &mut Tx) -> Result<u64, TxError> {
        let hdr = size_of::<BlockHdr<C>>() as u64;
        let bsize = highest_bit(size + hdr);
        let flist = self.freelist(bsize as usize);
        let head = flist.next.load(tx)?;
        let myblock: u64;
        if head != 0 {
            // Unlink the head block of this size class
            myblock = head;
            let next = self.hdr(head).next.load(tx)?;
            flist.next.store(tx, next)?;
        } else {
            // Carve a new block from the top of the pool
            let top = self.top_cell().load(tx)?;
            if top + (1u64 << bsize) > (self.pool_addr + self.pool_size) as u64 {
                log::warn!("esloco: out of memory for a {} byte allocation", size);
                return Ok(0);
            }
            self.top_cell().store(tx, top + (1u64 << bsize))?;
            self.hdr(top).size.store(tx, bsize)?;
            myblock = top;
        }
        Ok(myblock + hdr)
    }

    /// Returns a block to its size-class free-list.
    pub fn free(&self, ptr: u64, tx: &mut Tx) -> Result<(), TxError> {
        if ptr == 0 {
            return Ok(());
        }
        let hdr = size_of::<BlockHdr<C>>() as u64;
        let block = ptr - hdr;
        let exp = self.hdr(block).size.load(tx)?;
        let flist = self.freelist(exp as usize);
        let head = flist.next.load(tx)?;
        self.hdr(block).next.store(tx, head)?;
        flist.next.store(tx, block)?;
        Ok(())
    }

    fn top_cell(&self) -> &C {
        unsafe { &*(self.pool_addr as *const C) }
    }

    fn freelist(&self, exp: usize) -> &BlockHdr<C> {
        let addr = self.pool_addr + size_of::<C>() + exp * size_of::<BlockHdr<C>>();
        unsafe { &*(addr as *const BlockHdr<C>) }
    }

    fn hdr(&self, block: u64) -> &BlockHdr<C> {
        unsafe { &*(block as usize as *const BlockHdr<C>) }
    }

    fn metadata_end(&self) -> usize {
        self.pool_addr + size_of::<C>() + MAX_BLOCK_EXP * size_of::<BlockHdr<C>>()
    }
}
