//  Copyright 2020 Two Sigma Investments, LP.
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

use std::{
    ptr,
    slice,
    fs,
    os::unix::io::AsRawFd,
    ops::{Drop, Deref, DerefMut},
    path::Path,
};
use nix::sys::mman::{mmap, munmap, msync, MsFlags, ProtFlags, MapFlags};
use core::ffi::c_void;
use crate::error::{StreamError, Result};

/// `MappedFile` is a fixed-size, file-backed memory mapping, `MAP_SHARED` over a real file and
/// pre-allocated to its full size at creation: stream files never grow, they are simply filled
/// in as items are appended.
///
/// We don't use the memmap crate for the same reason the anonymous-mmap sibling of this type
/// didn't: a thin `NonNull` + `Deref`/`DerefMut` wrapper over `mmap()`/`munmap()` is all we need,
/// and it keeps the mapping lifetime tied to a single, obvious owner.
pub struct MappedFile {
    addr: ptr::NonNull<u8>,
    len: usize,
    writable: bool,
    // Kept alive so the fd stays valid and so `flush()` can `fsync()`. Not read from directly;
    // all access to file content goes through the mapping.
    file: fs::File,
}

impl MappedFile {
    /// Creates a new file of exactly `len` bytes and maps it read-write.
    pub fn create(path: &Path, len: usize) -> Result<Self> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| StreamError::io("create stream file", e))?;
        file.set_len(len as u64).map_err(|e| StreamError::io("preallocate stream file", e))?;
        Self::map(file, len, true)
    }

    /// Opens an existing file and maps it. `writable` selects `open_rw` vs `open_ro`.
    pub fn open(path: &Path, writable: bool) -> Result<Self> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)
            .map_err(|e| StreamError::io("open stream file", e))?;
        let len = file.metadata().map_err(|e| StreamError::io("stat stream file", e))?.len() as usize;
        Self::map(file, len, writable)
    }

    fn map(file: fs::File, len: usize, writable: bool) -> Result<Self> {
        let prot = if writable {
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE
        } else {
            ProtFlags::PROT_READ
        };

        let addr = unsafe {
            mmap(ptr::null_mut(), len, prot, MapFlags::MAP_SHARED, file.as_raw_fd(), 0)
                .map_err(|e| StreamError::io("mmap stream file", std::io::Error::from(e)))?
                as *mut u8
        };
        let addr = ptr::NonNull::new(addr)
            .ok_or_else(|| StreamError::invariant("mmap_buf", "mmap returned a null address"))?;

        Ok(Self { addr, len, writable, file })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Flushes modified pages and the underlying file descriptor to disk.
    pub fn flush(&self) -> Result<()> {
        unsafe {
            msync(self.addr.as_ptr() as *mut c_void, self.len, MsFlags::MS_SYNC)
                .map_err(|e| StreamError::io("msync stream file", std::io::Error::from(e)))?;
        }
        self.file.sync_data().map_err(|e| StreamError::io("fsync stream file", e))
    }
}

impl Deref for MappedFile {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.addr.as_ptr(), self.len) }
    }
}

impl DerefMut for MappedFile {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.addr.as_ptr(), self.len) }
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.addr.as_ptr() as *mut c_void, self.len);
        }
    }
}

// SAFETY: a stream is single-writer; callers are responsible for not handing out a
// `MappedFile` to multiple threads without synchronization of their own on top.
unsafe impl Send for MappedFile {}
