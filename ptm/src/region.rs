// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Fixed-address mapping of the persistent file. Every engine keeps absolute
//! pointers inside its region (redo logs, object directories), so a region
//! must come back at the same virtual address on every open; a mapping that
//! lands anywhere else is fatal.

use crate::flush::{NvmFence, CLFLUSH_FENCE};
use lazy_static::lazy_static;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

lazy_static! {
    static ref PAGE_SIZE: usize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
}

/// Construction parameters for a persistent region.
pub struct PmemConfig {
    pub file_path: PathBuf,
    pub map_addr: usize,
    pub region_size: usize,
    pub fences: &'static dyn NvmFence,
}

impl PmemConfig {
    pub fn new<P: AsRef<Path>>(file_path: P, map_addr: usize, region_size: usize) -> Self {
        Self {
            file_path: file_path.as_ref().to_path_buf(),
            map_addr,
            region_size,
            fences: &CLFLUSH_FENCE,
        }
    }

    /// Swaps in a fence implementation, e.g. [`crate::NoFence`] for tests.
    pub fn with_fences(mut self, fences: &'static dyn NvmFence) -> Self {
        self.fences = fences;
        self
    }
}

pub struct PmemRegion {
    base: *mut u8,
    len: usize,
    fd: libc::c_int,
    is_new: bool,
}

unsafe impl Send for PmemRegion {}
unsafe impl Sync for PmemRegion {}

impl PmemRegion {
    /// Maps `path` at exactly `addr`. Creates and sizes the file when it
    /// does not exist yet. Failure to open, size or map is fatal, per the
    /// engines' error policy.
    pub fn map(path: &Path, addr: usize, len: usize) -> Self {
        assert_eq!(addr % *PAGE_SIZE, 0, "mapping address must be page aligned");
        let existed = path.exists();
        let cpath = CString::new(path.as_os_str().as_bytes())
            .expect("persistent file path contains a nul byte");
        let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDWR | libc::O_CREAT, 0o755) };
        assert!(fd >= 0, "failed to open persistent file {}", path.display());
        if unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
            panic!("failed to size persistent file {} to {} bytes", path.display(), len);
        }
        let got = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if got == libc::MAP_FAILED || got as usize != addr {
            panic!(
                "mmap of persistent region failed: wanted {:#x}, got {:?}",
                addr, got
            );
        }
        log::info!(
            "mapped persistent region {} at {:#x} ({} bytes, {})",
            path.display(),
            addr,
            len,
            if existed { "reused" } else { "created" }
        );
        Self {
            base: got as *mut u8,
            len,
            fd,
            is_new: !existed,
        }
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True when the backing file was created by this mapping.
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base as usize && addr < self.base as usize + self.len
    }
}

impl Drop for PmemRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
            libc::close(self.fd);
        }
    }
}
