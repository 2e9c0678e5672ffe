//  Copyright 2024 Cedana.
//
//  Modifications licensed under the Apache License, Version 2.0.

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

//! Fixed-capacity object pools (C2): packet buffers, write-request records,
//! connection records. Built on `slab::Slab`, which already is the free-list
//! implementation we'd otherwise hand-roll.
//!
//! A `Handle` is an index into the pool, not a pointer: pool compaction or
//! slot reuse can never dangle it the way a raw pointer could.

use std::sync::Mutex;
use slab::Slab;
use crate::error::StreamError;

/// Pool capacity must fit a 16-bit free-list index.
pub const MAX_POOL_CAPACITY: usize = 1 << 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u16);

impl Handle {
    fn from_key(key: usize) -> Self {
        Handle(key as u16)
    }

    fn key(self) -> usize {
        self.0 as usize
    }
}

/// Thread-safe fixed-capacity free-list pool. `acquire`/`release` are mutex-guarded; callers
/// should acquire close to their use site.
pub struct Pool<T> {
    capacity: usize,
    inner: Mutex<Slab<T>>,
}

impl<T: Default> Pool<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0 && capacity <= MAX_POOL_CAPACITY, "pool capacity out of range");
        Self {
            capacity,
            inner: Mutex::new(Slab::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a zeroed (`T::default()`) slot, or `CapacityExceeded` when the pool is full.
    pub fn acquire(&self) -> Result<Handle, StreamError> {
        let mut slab = self.inner.lock().unwrap();
        if slab.len() >= self.capacity {
            return Err(StreamError::CapacityExceeded { what: "object pool", capacity: self.capacity });
        }
        let key = slab.insert(T::default());
        Ok(Handle::from_key(key))
    }

    /// Releases a previously acquired slot. Fails with `InvariantViolated` if `handle` does not
    /// currently belong to this pool, in place of a pointer-range check over raw memory.
    pub fn release(&self, handle: Handle) -> Result<(), StreamError> {
        let mut slab = self.inner.lock().unwrap();
        if !slab.contains(handle.key()) {
            return Err(StreamError::invariant("object pool", "release of a handle foreign to this pool"));
        }
        slab.remove(handle.key());
        Ok(())
    }

    pub fn with<R>(&self, handle: Handle, f: impl FnOnce(&T) -> R) -> Result<R, StreamError> {
        let slab = self.inner.lock().unwrap();
        let slot = slab.get(handle.key())
            .ok_or_else(|| StreamError::invariant("object pool", "access of a handle foreign to this pool"))?;
        Ok(f(slot))
    }

    pub fn with_mut<R>(&self, handle: Handle, f: impl FnOnce(&mut T) -> R) -> Result<R, StreamError> {
        let mut slab = self.inner.lock().unwrap();
        let slot = slab.get_mut(handle.key())
            .ok_or_else(|| StreamError::invariant("object pool", "access of a handle foreign to this pool"))?;
        Ok(f(slot))
    }
}

/// A fixed-max-payload packet buffer, the canonical instantiation of `Pool<T>`: network code
/// (out of scope here) would fill `data[..len]` from a socket read and hand the packet to a
/// protocol decoder.
#[derive(Default)]
pub struct PacketBuf {
    pub data: Vec<u8>,
    pub len: usize,
    /// Index into a connection pool, not a raw pointer.
    pub connection: Option<Handle>,
}

pub type PacketPool = Pool<PacketBuf>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_roundtrip() {
        let pool: Pool<PacketBuf> = Pool::new(2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(pool.acquire().is_err());
        pool.release(a).unwrap();
        let c = pool.acquire().unwrap();
        assert!(pool.acquire().is_err());
        pool.release(b).unwrap();
        pool.release(c).unwrap();
    }

    #[test]
    fn release_foreign_handle_fails() {
        let pool: Pool<PacketBuf> = Pool::new(1);
        let h = pool.acquire().unwrap();
        pool.release(h).unwrap();
        assert!(pool.release(h).is_err());
    }

    #[test]
    fn with_mut_sees_writes() {
        let pool: Pool<PacketBuf> = Pool::new(1);
        let h = pool.acquire().unwrap();
        pool.with_mut(h, |p| { p.data = vec![1, 2, 3]; p.len = 3; }).unwrap();
        let len = pool.with(h, |p| p.len).unwrap();
        assert_eq!(len, 3);
    }
}
