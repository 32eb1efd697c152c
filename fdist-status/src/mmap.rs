// Copyright 2024-Present the fdist maintainers
// SPDX-License-Identifier: Apache-2.0

//! File-backed shared mappings.

use nix::sys::mman::{mmap, msync, munmap, MapFlags, MsFlags, ProtFlags};
use nix::unistd::ftruncate;
use std::fs::File;
use std::io;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

fn page_aligned_size(size: usize) -> usize {
    let page_size = page_size::get();
    // round up to nearest page
    ((size - 1) & !(page_size - 1)) + page_size
}

/// A read-write shared mapping over an open file. The mapping length is
/// page aligned; the logical length lives in the record header, not here.
pub struct MappedRegion {
    ptr: NonNull<libc::c_void>,
    len: usize,
}

impl MappedRegion {
    /// Map `len` bytes of `file`, growing the file to that size first.
    pub fn create(file: &File, len: usize) -> io::Result<MappedRegion> {
        let len = page_aligned_size(len);
        ftruncate(file, len as libc::off_t)?;
        Self::map_fd(file, len)
    }

    /// Map an existing file at its current size.
    pub fn open(file: &File) -> io::Result<MappedRegion> {
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "cannot map an empty file",
            ));
        }
        Self::map_fd(file, page_aligned_size(len))
    }

    fn map_fd(file: &File, len: usize) -> io::Result<MappedRegion> {
        // Safety: the file stays open for the duration of the call and the
        // length is nonzero.
        let ptr = unsafe {
            mmap(
                None,
                NonZeroUsize::new(len).expect("length is page aligned and nonzero"),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                file,
                0,
            )?
        };
        Ok(MappedRegion { ptr, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // Safety: the mapping is live and `len` bytes long.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr() as *const u8, self.len) }
    }

    pub fn as_slice_mut(&mut self) -> &mut [u8] {
        // Safety: as above, with exclusive access through &mut self.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr() as *mut u8, self.len) }
    }

    /// Schedule dirty pages for write-back.
    pub fn sync(&self) -> io::Result<()> {
        // Safety: ptr/len describe a live mapping.
        unsafe { msync(self.ptr, self.len, MsFlags::MS_ASYNC) }?;
        Ok(())
    }

    /// Synchronous write-back, used before detaching with `sync = true`.
    pub fn sync_blocking(&self) -> io::Result<()> {
        // Safety: ptr/len describe a live mapping.
        unsafe { msync(self.ptr, self.len, MsFlags::MS_SYNC) }?;
        Ok(())
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // Safety: the mapping has not been unmapped elsewhere.
        unsafe {
            _ = munmap(self.ptr, self.len);
        }
    }
}

// The region is plain shared memory; all access synchronisation happens
// through the record locks layered above.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}
