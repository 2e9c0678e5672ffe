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

//! On-disk layout of one stream (C5): header, ID table, item-offset table,
//! packed items, all little-endian. Built on [`crate::mmap_buf::MappedFile`].
//! Not cross-endian portable and not multi-writer; a stream has exactly one
//! writer for its lifetime.
//!
//! `item_count` is the single field readers synchronize on: it is bumped
//! with a release store only after the item body and its offset-table entry
//! are visible, so a reader that observes `item_count = n` is guaranteed to
//! see valid records at `[0, n)`.

use std::{
    path::Path,
    sync::atomic::{AtomicU32, Ordering},
};
use crate::mmap_buf::MappedFile;
use crate::error::{StreamError, Result};

pub const NAME_LEN: usize = 64;

mod off {
    pub const NAME: usize = 0;
    pub const TIME_BEGIN: usize = 64;
    pub const TIME_END: usize = 72;
    pub const IDS_COUNT: usize = 80;
    pub const IDS_CAPACITY: usize = 84;
    pub const ITEM_COUNT: usize = 88;
    pub const ITEM_CAPACITY: usize = 92;
    pub const WRITE_CURSOR: usize = 96;
    /// Which typed writer this stream accepts (u8/u16/u32/f32/fixed-data/variable-data).
    pub const STREAM_TYPE: usize = 104;
    /// Fixed-item payload size in bytes; 0 for a variable-data stream.
    pub const SIZEOF_ITEM: usize = 108;
}

pub const HEADER_LEN: usize = off::SIZEOF_ITEM + 4;

/// Which typed writer a stream accepts. Persisted in the header so a reopened stream still
/// knows how to validate writes without the caller repeating itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamKind {
    FixedU8 = 1,
    FixedU16 = 2,
    FixedU32 = 3,
    FixedF32 = 4,
    FixedData = 5,
    VariableData = 6,
}

impl StreamKind {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(Self::FixedU8),
            2 => Ok(Self::FixedU16),
            3 => Ok(Self::FixedU32),
            4 => Ok(Self::FixedF32),
            5 => Ok(Self::FixedData),
            6 => Ok(Self::VariableData),
            other => Err(StreamError::invariant("stream_file::StreamKind", format!("unknown stream_type byte {other}"))),
        }
    }
}

/// An item read back from a stream, borrowing its payload directly from the mapping.
#[derive(Debug)]
pub struct Item<'a> {
    pub time: u64,
    pub id: u64,
    pub data: &'a [u8],
}

/// A snapshot over a stream's items, fixed at `item_count` when created. Readers that hold
/// one may run concurrently with the single writer.
pub struct StreamIterator<'a> {
    stream: &'a StreamFile,
    max_index: u32,
    cursor: Option<u32>,
}

impl<'a> StreamIterator<'a> {
    pub fn max_index(&self) -> u32 {
        self.max_index
    }

    pub fn cursor(&self) -> Option<u32> {
        self.cursor
    }

    /// Advances to the next item; `false` once the snapshot is exhausted.
    pub fn advance(&mut self) -> bool {
        let next = match self.cursor {
            None => 0,
            Some(c) => c + 1,
        };
        if next >= self.max_index {
            return false;
        }
        self.cursor = Some(next);
        true
    }

    pub fn get_item(&self, relative_index: u32) -> Result<Item<'a>> {
        self.stream.get_item(relative_index, self.max_index)
    }

    pub fn get_current(&self) -> Result<Item<'a>> {
        let idx = self.cursor.ok_or_else(|| {
            StreamError::invalid("stream_file::get_current", "advance() was never called")
        })?;
        self.stream.get_item(idx, self.max_index)
    }
}

impl<'a> Drop for StreamIterator<'a> {
    fn drop(&mut self) {
        self.stream.live_iterators.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct StreamFile {
    file: MappedFile,
    ids_capacity: u32,
    item_capacity: u32,
    live_iterators: AtomicU32,
    /// Sticky once set by a failed append; re-validated (never cleared) for the file's lifetime.
    full: std::sync::atomic::AtomicBool,
}

impl StreamFile {
    /// Creates a new variable-data stream file. For a fixed-type stream created through the
    /// stream manager, use [`Self::create_typed`].
    pub fn create(
        path: &Path,
        name: &str,
        time_begin: u64,
        ids_capacity: u32,
        item_capacity: u32,
        file_size: u64,
    ) -> Result<Self> {
        Self::create_typed(path, name, time_begin, ids_capacity, item_capacity, file_size, StreamKind::VariableData, 0)
    }

    /// Creates a new stream file of exactly `file_size` bytes, pre-allocated and zeroed, with
    /// the given table capacities and typed-writer metadata.
    #[allow(clippy::too_many_arguments)]
    pub fn create_typed(
        path: &Path,
        name: &str,
        time_begin: u64,
        ids_capacity: u32,
        item_capacity: u32,
        file_size: u64,
        stream_type: StreamKind,
        sizeof_item: u32,
    ) -> Result<Self> {
        if name.len() >= NAME_LEN {
            return Err(StreamError::invalid("stream_file::create", "name too long"));
        }
        let required = HEADER_LEN as u64 + 8 * ids_capacity as u64 + 4 * item_capacity as u64;
        if file_size < required {
            return Err(StreamError::invalid("stream_file::create", "file_size too small for requested capacities"));
        }

        let file = MappedFile::create(path, file_size as usize)?;
        let mut stream = Self {
            file,
            ids_capacity,
            item_capacity,
            live_iterators: AtomicU32::new(0),
            full: std::sync::atomic::AtomicBool::new(false),
        };

        stream.set_name(name);
        stream.set_time_begin(time_begin);
        stream.set_time_end(time_begin);
        stream.set_ids_count(0);
        stream.set_u32(off::IDS_CAPACITY, ids_capacity);
        stream.item_count_atomic().store(0, Ordering::Relaxed);
        stream.set_u32(off::ITEM_CAPACITY, item_capacity);
        stream.file[off::STREAM_TYPE] = stream_type as u8;
        stream.set_u32(off::SIZEOF_ITEM, sizeof_item);
        let write_cursor = stream.items_region_offset() as u64;
        stream.set_write_cursor(write_cursor);

        Ok(stream)
    }

    pub fn stream_type(&self) -> Result<StreamKind> {
        StreamKind::from_u8(self.file[off::STREAM_TYPE])
    }

    pub fn sizeof_item(&self) -> u32 {
        self.u32(off::SIZEOF_ITEM)
    }

    /// Opens an existing stream file read-write. If `expected_name` is given, it is validated
    /// against the header's `name` field.
    pub fn open_rw(path: &Path, expected_name: Option<&str>) -> Result<Self> {
        Self::open(path, true, expected_name)
    }

    /// Opens an existing stream file read-only.
    pub fn open_ro(path: &Path, expected_name: Option<&str>) -> Result<Self> {
        Self::open(path, false, expected_name)
    }

    fn open(path: &Path, writable: bool, expected_name: Option<&str>) -> Result<Self> {
        let file = MappedFile::open(path, writable)?;
        if file.len() < HEADER_LEN {
            return Err(StreamError::invariant("stream_file::open", "file too small to hold a header"));
        }

        let ids_capacity = u32::from_le_bytes(file[off::IDS_CAPACITY..off::IDS_CAPACITY + 4].try_into().unwrap());
        let item_capacity = u32::from_le_bytes(file[off::ITEM_CAPACITY..off::ITEM_CAPACITY + 4].try_into().unwrap());

        let stream = Self {
            file,
            ids_capacity,
            item_capacity,
            live_iterators: AtomicU32::new(0),
            full: std::sync::atomic::AtomicBool::new(false),
        };

        let required = stream.items_region_offset() as u64;
        if (stream.file.len() as u64) < required {
            return Err(StreamError::invariant("stream_file::open", "table capacities exceed file size"));
        }
        if stream.ids_count() > stream.ids_capacity {
            return Err(StreamError::invariant("stream_file::open", "ids_count exceeds ids_capacity"));
        }
        if stream.item_count() > stream.item_capacity {
            return Err(StreamError::invariant("stream_file::open", "item_count exceeds item_capacity"));
        }

        let name = stream.name().map_err(|_| StreamError::invariant("stream_file::open", "name is not valid UTF-8"))?;
        if let Some(expected) = expected_name {
            if name != expected {
                return Err(StreamError::invalid("stream_file::open", format!("name mismatch: expected {expected}, got {name}")));
            }
        }

        stream.full.store(stream.write_cursor() >= stream.file.len() as u64, Ordering::Relaxed);
        Ok(stream)
    }

    // --- raw field access -------------------------------------------------

    fn u32(&self, off: usize) -> u32 {
        u32::from_le_bytes(self.file[off..off + 4].try_into().unwrap())
    }

    fn set_u32(&mut self, off: usize, v: u32) {
        self.file[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn u64(&self, off: usize) -> u64 {
        u64::from_le_bytes(self.file[off..off + 8].try_into().unwrap())
    }

    fn set_u64(&mut self, off: usize, v: u64) {
        self.file[off..off + 8].copy_from_slice(&v.to_le_bytes());
    }

    fn item_count_atomic(&self) -> &AtomicU32 {
        // SAFETY: `AtomicU32` has the same size, alignment and bit validity as `u32`, and
        // `off::ITEM_COUNT` is 4-byte aligned within the mapping (HEADER_LEN is a multiple of 8).
        unsafe { &*(self.file.as_ptr().add(off::ITEM_COUNT) as *const AtomicU32) }
    }

    pub fn name(&self) -> std::result::Result<&str, std::str::Utf8Error> {
        let raw = &self.file[off::NAME..off::NAME + NAME_LEN];
        let end = raw.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        std::str::from_utf8(&raw[..end])
    }

    fn set_name(&mut self, name: &str) {
        let bytes = name.as_bytes();
        self.file[off::NAME..off::NAME + bytes.len()].copy_from_slice(bytes);
        self.file[off::NAME + bytes.len()..off::NAME + NAME_LEN].fill(0);
    }

    pub fn time_begin(&self) -> u64 {
        self.u64(off::TIME_BEGIN)
    }

    fn set_time_begin(&mut self, v: u64) {
        self.set_u64(off::TIME_BEGIN, v);
    }

    pub fn time_end(&self) -> u64 {
        self.u64(off::TIME_END)
    }

    fn set_time_end(&mut self, v: u64) {
        self.set_u64(off::TIME_END, v);
    }

    pub fn ids_count(&self) -> u32 {
        self.u32(off::IDS_COUNT)
    }

    fn set_ids_count(&mut self, v: u32) {
        self.set_u32(off::IDS_COUNT, v);
    }

    pub fn ids_capacity(&self) -> u32 {
        self.ids_capacity
    }

    pub fn item_count(&self) -> u32 {
        self.item_count_atomic().load(Ordering::Acquire)
    }

    pub fn item_capacity(&self) -> u32 {
        self.item_capacity
    }

    pub fn write_cursor(&self) -> u64 {
        self.u64(off::WRITE_CURSOR)
    }

    fn set_write_cursor(&mut self, v: u64) {
        self.set_u64(off::WRITE_CURSOR, v);
    }

    pub fn is_full(&self) -> bool {
        self.full.load(Ordering::Relaxed)
    }

    pub fn live_iterators(&self) -> u32 {
        self.live_iterators.load(Ordering::SeqCst)
    }

    // --- table layout -------------------------------------------------

    fn id_table_offset(&self) -> usize {
        HEADER_LEN
    }

    fn offset_table_offset(&self) -> usize {
        self.id_table_offset() + 8 * self.ids_capacity as usize
    }

    fn items_region_offset(&self) -> usize {
        self.offset_table_offset() + 4 * self.item_capacity as usize
    }

    fn id_table_get(&self, index: u32) -> u64 {
        let start = self.id_table_offset() + 8 * index as usize;
        self.u64(start)
    }

    fn id_table_set(&mut self, index: u32, id: u64) {
        let start = self.id_table_offset() + 8 * index as usize;
        self.set_u64(start, id);
    }

    fn offset_table_get(&self, index: u32) -> u32 {
        let start = self.offset_table_offset() + 4 * index as usize;
        self.u32(start)
    }

    fn offset_table_set(&mut self, index: u32, offset: u32) {
        let start = self.offset_table_offset() + 4 * index as usize;
        self.set_u32(start, offset);
    }

    /// Returns the existing `id_index` for `id`, or inserts it. A full ID table surfaces as
    /// `NotFound`, not `CapacityExceeded`.
    fn find_or_add_id(&mut self, id: u64) -> Result<u16> {
        let ids_count = self.ids_count();
        for i in 0..ids_count {
            if self.id_table_get(i) == id {
                return Ok(i as u16);
            }
        }
        if ids_count >= self.ids_capacity {
            return Err(StreamError::not_found("id table slot", format!("{id:#x}")));
        }
        self.id_table_set(ids_count, id);
        self.set_ids_count(ids_count + 1);
        Ok(ids_count as u16)
    }

    /// Appends one item. `data.len()` becomes the record's payload size; callers enforcing a
    /// fixed `sizeof_item` do so above this layer (C8).
    pub fn write_item(&mut self, time: u64, id: u64, data: &[u8]) -> Result<()> {
        if self.is_full() {
            return Err(StreamError::CapacityExceeded { what: "stream file", capacity: self.file.len() });
        }

        let write_cursor = self.write_cursor();
        let needed = 8u64 + data.len() as u64;
        if write_cursor + needed > self.file.len() as u64 {
            self.set_write_cursor(self.file.len() as u64);
            self.full.store(true, Ordering::Relaxed);
            return Err(StreamError::CapacityExceeded { what: "stream file bytes", capacity: self.file.len() });
        }
        if self.item_count() >= self.item_capacity {
            self.set_write_cursor(self.file.len() as u64);
            self.full.store(true, Ordering::Relaxed);
            return Err(StreamError::CapacityExceeded { what: "stream file items", capacity: self.item_capacity as usize });
        }

        if self.item_count() == 0 {
            self.set_time_begin(time);
        }

        let id_index = self.find_or_add_id(id)?;

        let relative_time = time - self.time_begin();
        let record_offset = write_cursor as usize;
        self.file[record_offset..record_offset + 6].copy_from_slice(&relative_time.to_le_bytes()[..6]);
        self.file[record_offset + 6..record_offset + 8].copy_from_slice(&id_index.to_be_bytes());
        self.file[record_offset + 8..record_offset + 8 + data.len()].copy_from_slice(data);

        let item_count = self.item_count();
        self.offset_table_set(item_count, write_cursor as u32);

        let new_time_end = self.time_end().max(time);
        self.set_time_end(new_time_end);
        self.set_write_cursor(write_cursor + needed);

        // Publish last: a reader that observes the new item_count is guaranteed (by the
        // release/acquire pairing) to see the record and offset-table entry written above.
        self.item_count_atomic().fetch_add(1, Ordering::Release);
        Ok(())
    }

    /// Captures a snapshot over the current `item_count`.
    pub fn create_iterator(&self) -> StreamIterator<'_> {
        self.live_iterators.fetch_add(1, Ordering::SeqCst);
        StreamIterator { stream: self, max_index: self.item_count(), cursor: None }
    }

    fn get_item(&self, idx: u32, max_index: u32) -> Result<Item<'_>> {
        if idx >= max_index || max_index == 0 {
            return Err(StreamError::invalid("stream_file::get_item", "index out of range for this iterator's snapshot"));
        }

        let item_offset = self.offset_table_get(idx);
        let size = if self.item_count() > idx + 1 {
            self.offset_table_get(idx + 1) - item_offset - 8
        } else {
            (self.write_cursor() as u32) - item_offset - 8
        };

        let record_offset = item_offset as usize;
        let mut time_buf = [0u8; 8];
        time_buf[..6].copy_from_slice(&self.file[record_offset..record_offset + 6]);
        let relative_time = u64::from_le_bytes(time_buf);
        let id_index = u16::from_be_bytes(self.file[record_offset + 6..record_offset + 8].try_into().unwrap());
        let id = self.id_table_get(id_index as u32);

        let data_start = record_offset + 8;
        let data = &self.file[data_start..data_start + size as usize];

        Ok(Item { time: self.time_begin() + relative_time, id, data })
    }

    pub fn flush(&self) -> Result<()> {
        self.file.flush()
    }

    /// Flushes and consumes the stream. Unlike a runtime check, the borrow checker already makes
    /// it impossible to call this while a `StreamIterator` borrowed from `self` is still alive —
    /// the counter below exists for the debug assertion on `Drop`, not to gate this method.
    pub fn close(self) -> Result<()> {
        self.flush()
    }
}

impl Drop for StreamFile {
    fn drop(&mut self) {
        debug_assert_eq!(self.live_iterators(), 0, "stream file dropped with live iterators");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn tmp_path(name: &str) -> std::path::PathBuf {
        let mut p = env::temp_dir();
        p.push(format!("streamkeep-test-{}-{}", std::process::id(), name));
        p
    }

    #[test]
    fn create_append_read_back() {
        let path = tmp_path("create_append_read_back.rwstream");
        let mut s = StreamFile::create(&path, "t", 0, 4, 16, 64 * 1024).unwrap();

        s.write_item(1000, 0xAA, &[1, 2, 3, 4]).unwrap();
        s.write_item(1500, 0xBB, &[5, 6, 7, 8]).unwrap();
        s.write_item(1500, 0xAA, &[9, 10, 11, 12]).unwrap();

        assert_eq!(s.item_count(), 3);
        assert_eq!(s.time_begin(), 1000);
        assert_eq!(s.time_end(), 1500);
        assert_eq!(s.ids_count(), 2);

        let it = s.create_iterator();
        let item0 = it.get_item(0).unwrap();
        assert_eq!((item0.time, item0.id, item0.data), (1000, 0xAA, &[1, 2, 3, 4][..]));
        let item2 = it.get_item(2).unwrap();
        assert_eq!((item2.time, item2.id, item2.data), (1500, 0xAA, &[9, 10, 11, 12][..]));

        drop(it);
        s.close().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn full_stream_rejects_third_item() {
        let path = tmp_path("full_stream_rejects_third_item.rwstream");
        let mut s = StreamFile::create(&path, "t", 0, 4, 2, 64 * 1024).unwrap();

        s.write_item(1, 1, &[0]).unwrap();
        s.write_item(2, 1, &[0]).unwrap();
        assert!(s.write_item(3, 1, &[0]).is_err());
        assert!(s.is_full());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn byte_boundary_marks_full() {
        let path = tmp_path("byte_boundary_marks_full.rwstream");
        let header_and_tables = HEADER_LEN + 8 * 1 + 4 * 4;
        let file_size = header_and_tables as u64 + 8 + 4; // room for exactly one 4-byte item
        let mut s = StreamFile::create(&path, "t", 0, 1, 4, file_size).unwrap();

        s.write_item(1, 1, &[1, 2, 3, 4]).unwrap();
        assert!(s.write_item(2, 1, &[1]).is_err());
        assert!(s.is_full());
        assert_eq!(s.write_cursor(), file_size);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn id_table_full_returns_not_found() {
        let path = tmp_path("id_table_full_returns_not_found.rwstream");
        let mut s = StreamFile::create(&path, "t", 0, 1, 8, 64 * 1024).unwrap();
        s.write_item(1, 0xAA, &[0]).unwrap();
        let err = s.write_item(2, 0xBB, &[0]).unwrap_err();
        assert!(matches!(err, StreamError::NotFound { .. }));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn live_iterator_count_tracks_create_and_drop() {
        let path = tmp_path("live_iterator_count_tracks_create_and_drop.rwstream");
        let s = StreamFile::create(&path, "t", 0, 4, 4, 64 * 1024).unwrap();
        assert_eq!(s.live_iterators(), 0);
        let it = s.create_iterator();
        assert_eq!(s.live_iterators(), 1);
        drop(it);
        assert_eq!(s.live_iterators(), 0);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn reopen_round_trips_through_close() {
        let path = tmp_path("reopen_round_trips_through_close.rwstream");
        {
            let mut s = StreamFile::create(&path, "t", 0, 4, 4, 64 * 1024).unwrap();
            s.write_item(42, 7, &[9, 9]).unwrap();
            s.close().unwrap();
        }
        let s = StreamFile::open_ro(&path, Some("t")).unwrap();
        assert_eq!(s.item_count(), 1);
        let it = s.create_iterator();
        let item = it.get_item(0).unwrap();
        assert_eq!((item.time, item.id, item.data), (42, 7, &[9, 9][..]));

        let _ = std::fs::remove_file(&path);
    }
}
