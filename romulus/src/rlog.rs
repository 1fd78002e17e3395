// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The byte-range log: a chunked list of `{offset, length}` entries
//! relative to the `main` region. A short lookback coalesces stores that
//! land on one cache line into a single 64-byte entry, and once the log
//! outgrows a quarter of the used region the transaction falls back to a
//! full region copy at commit instead of logging further.

/// Entries per log chunk.
pub const CHUNK_SIZE: usize = 1024;

const CACHE_LINE: usize = 64;
/// How many tail entries the same-cache-line coalescing looks back over.
const LOOKBACK: usize = 16;

#[derive(Clone, Copy, Default)]
pub struct LogEntry {
    pub offset: usize,
    pub length: usize,
}

pub(crate) struct LogChunk {
    entries: [LogEntry; CHUNK_SIZE],
    num_entries: usize,
}

impl LogChunk {
    fn new() -> Self {
        Self {
            entries: [LogEntry::default(); CHUNK_SIZE],
            num_entries: 0,
        }
    }
}

pub struct RangeLog {
    chunks: Vec<LogChunk>,
    log_size: usize,
    enabled: bool,
}

impl RangeLog {
    pub fn new() -> Self {
        // There is always at least one (possibly empty) chunk
        Self {
            chunks: vec![LogChunk::new()],
            log_size: 0,
            enabled: true,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn len_bytes(&self) -> usize {
        self.log_size
    }

    /// Records that `length` bytes at absolute address `addr` inside `main`
    /// changed. Disables itself (full-copy fallback) once the logged volume
    /// passes a quarter of the used region size.
    pub fn add(&mut self, addr: usize, length: usize, main_addr: usize, used_size: usize) {
        if !self.enabled {
            return;
        }
        if self.log_size > used_size / 4 {
            self.enabled = false;
            return;
        }

        let addr_cl = addr >> 6;
        let same_cl = addr_cl == (addr + length) >> 6;
        if same_cl {
            // The range sits inside one cache line; maybe it is already
            // covered by a recent whole-line entry.
            let tail = self.chunks.last().unwrap();
            let n = tail.num_entries;
            for i in (n.saturating_sub(LOOKBACK)..n).rev() {
                let e = &tail.entries[i];
                let e_addr = e.offset + main_addr;
                if e.length == CACHE_LINE && e_addr & (CACHE_LINE - 1) == 0 && e_addr >> 6 == addr_cl
                {
                    return;
                }
            }
        }

        if self.chunks.last().unwrap().num_entries == CHUNK_SIZE {
            self.chunks.push(LogChunk::new());
        }
        let tail = self.chunks.last_mut().unwrap();
        let e = &mut tail.entries[tail.num_entries];
        if same_cl {
            e.offset = (addr_cl << 6) - main_addr;
            e.length = CACHE_LINE;
        } else {
            e.offset = addr - main_addr;
            e.length = length;
        }
        tail.num_entries += 1;
        self.log_size += length;
    }

    pub fn iter(&self) -> impl Iterator<Item = LogEntry> + '_ {
        self.chunks
            .iter()
            .flat_map(|c| c.entries[..c.num_entries].iter().copied())
    }

    /// Drops everything, keeping a single empty chunk for the next
    /// transaction.
    pub fn clear(&mut self) {
        self.chunks.truncate(1);
        self.chunks[0].num_entries = 0;
        self.log_size = 0;
    }
}

impl Default for RangeLog {
    fn default() -> Self {
        Self::new()
    }
}
