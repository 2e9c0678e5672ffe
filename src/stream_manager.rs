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

//! Directory of all open streams (C6): read-only streams discovered one
//! level under `basepath`, read-write streams at `basepath`'s root.
//!
//! The per-file header (`stream_file::StreamFile`) has no room for catalog
//! bookkeeping — `user_id` and `user_index` identify a stream for
//! registration purposes but aren't part of the append-engine's on-disk
//! format. We carry them in the filename instead (`<user_id hex>-
//! <user_index>-<name>.rwstream`), which is the one thing guaranteed to
//! survive a directory scan without widening the append-engine header.
//!
//! `StreamId` is a tagged enum rather than a packed integer: handles are
//! never persisted, so there is no encoding to be compatible with.

use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};
use crate::stream_file::{StreamFile, StreamKind, StreamIterator};
use crate::error::{StreamError, Result};
use crate::util::now_millis;

/// Opaque handle to an open stream. Never persisted; decoding is internal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamId {
    ReadWrite(u32),
    ReadOnly(u32),
}

struct StreamEntry {
    file: StreamFile,
    path: PathBuf,
    user_id: u64,
    user_index: u16,
}

pub struct StreamManager {
    base_path: PathBuf,
    ro_streams: Vec<StreamEntry>,
    rw_streams: Vec<StreamEntry>,
}

fn rw_extension() -> &'static str {
    "rwstream"
}

fn ro_extension() -> &'static str {
    "rostream"
}

/// `<user_id:016x>-<user_index>-<name>`, the catalog identity encoded into a stream's basename.
fn encode_stem(user_id: u64, user_index: u16, name: &str) -> String {
    format!("{user_id:016x}-{user_index}-{name}")
}

fn parse_stem(stem: &str) -> Option<(u64, u16, String)> {
    let mut parts = stem.splitn(3, '-');
    let user_id = u64::from_str_radix(parts.next()?, 16).ok()?;
    let user_index = parts.next()?.parse().ok()?;
    let name = parts.next()?.to_string();
    Some((user_id, user_index, name))
}

impl StreamManager {
    /// Scans `base_path` for existing streams and returns a manager ready to register new ones.
    /// A missing `base_path` is created; an unreadable one is an IO error.
    pub fn open(base_path: &Path) -> Result<Self> {
        crate::util::create_dir_all(base_path)
            .map_err(|e| StreamError::io("create stream manager base path", std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;

        let mut manager = Self { base_path: base_path.to_path_buf(), ro_streams: Vec::new(), rw_streams: Vec::new() };
        manager.scan()?;
        Ok(manager)
    }

    fn scan(&mut self) -> Result<()> {
        let entries = fs::read_dir(&self.base_path).map_err(|e| StreamError::io("scan stream manager base path", e))?;
        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "stream_manager: skipping unreadable directory entry");
                    continue;
                }
            };
            let file_type = match entry.file_type() {
                Ok(t) => t,
                Err(e) => {
                    warn!(error = %e, "stream_manager: skipping entry with unknown file type");
                    continue;
                }
            };

            if file_type.is_dir() {
                self.scan_ro_subdir(&entry.path());
            } else if has_extension(&entry.path(), rw_extension()) {
                self.adopt_rw(&entry.path());
            }
        }
        Ok(())
    }

    fn scan_ro_subdir(&mut self, dir: &Path) {
        let entries = match fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, dir = %dir.display(), "stream_manager: skipping unreadable read-only subdirectory");
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if has_extension(&path, ro_extension()) {
                self.adopt_ro(&path);
            }
        }
    }

    fn adopt_rw(&mut self, path: &Path) {
        let Some((user_id, user_index, name)) = stem_of(path).and_then(|s| parse_stem(&s)) else {
            warn!(path = %path.display(), "stream_manager: skipping rwstream with unparsable filename");
            return;
        };
        match StreamFile::open_rw(path, Some(&name)) {
            Ok(file) => {
                debug!(path = %path.display(), %user_id, user_index, "stream_manager: adopted read-write stream");
                self.rw_streams.push(StreamEntry { file, path: path.to_path_buf(), user_id, user_index });
            }
            Err(e) => warn!(path = %path.display(), error = %e, "stream_manager: skipping corrupt rwstream"),
        }
    }

    fn adopt_ro(&mut self, path: &Path) {
        let Some((user_id, user_index, name)) = stem_of(path).and_then(|s| parse_stem(&s)) else {
            warn!(path = %path.display(), "stream_manager: skipping rostream with unparsable filename");
            return;
        };
        match StreamFile::open_ro(path, Some(&name)) {
            Ok(file) => {
                debug!(path = %path.display(), %user_id, user_index, "stream_manager: adopted read-only stream");
                self.ro_streams.push(StreamEntry { file, path: path.to_path_buf(), user_id, user_index });
            }
            Err(e) => warn!(path = %path.display(), error = %e, "stream_manager: skipping corrupt rostream"),
        }
    }

    fn largest_user_index_for(&self, user_id: u64) -> u16 {
        self.ro_streams.iter()
            .chain(self.rw_streams.iter())
            .filter(|e| e.user_id == user_id)
            .map(|e| e.user_index)
            .max()
            .unwrap_or(0)
    }

    /// Creates and adopts a new read-write stream.
    #[allow(clippy::too_many_arguments)]
    pub fn register(
        &mut self,
        stream_type: StreamKind,
        name: &str,
        user_id: u64,
        file_size: u64,
        sizeof_item: u32,
        ids_capacity: u32,
        item_capacity: u32,
    ) -> Result<StreamId> {
        let user_index = self.next_user_index(user_id);
        let path = self.build_rw_path(user_id, user_index, name);

        let file = StreamFile::create_typed(
            &path,
            name,
            now_millis(),
            ids_capacity,
            item_capacity,
            file_size,
            stream_type,
            sizeof_item,
        )?;

        let id = self.adopt_created(file, path, user_id, user_index);
        debug!(name, %user_id, user_index, "stream_manager: registered new stream");
        Ok(id)
    }

    /// The `user_index` a new stream for `user_id` would receive right now. Exposed so the
    /// stream-request pipeline (C7) can reserve it on the control thread before handing file
    /// creation off to a worker — `largest_user_index_for` itself is control-thread-only state,
    /// so the reservation can't happen inside the worker.
    pub(crate) fn next_user_index(&self, user_id: u64) -> u16 {
        self.largest_user_index_for(user_id) + 1
    }

    pub(crate) fn build_rw_path(&self, user_id: u64, user_index: u16, name: &str) -> PathBuf {
        let stem = encode_stem(user_id, user_index, name);
        self.base_path.join(format!("{stem}.{}", rw_extension()))
    }

    /// Records a `StreamFile` that a worker built off-thread. The catalog insert itself still
    /// only ever happens on the control thread, same as `register`.
    pub(crate) fn adopt_created(&mut self, file: StreamFile, path: PathBuf, user_id: u64, user_index: u16) -> StreamId {
        let index = self.rw_streams.len() as u32;
        self.rw_streams.push(StreamEntry { file, path, user_id, user_index });
        StreamId::ReadWrite(index)
    }

    fn rw_entry(&self, id: StreamId) -> Result<&StreamEntry> {
        match id {
            StreamId::ReadWrite(idx) => self.rw_streams.get(idx as usize)
                .ok_or_else(|| StreamError::invalid("stream_manager", "stream index out of range")),
            StreamId::ReadOnly(_) => Err(StreamError::invalid("stream_manager", "stream is read-only")),
        }
    }

    fn rw_entry_mut(&mut self, id: StreamId) -> Result<&mut StreamEntry> {
        match id {
            StreamId::ReadWrite(idx) => self.rw_streams.get_mut(idx as usize)
                .ok_or_else(|| StreamError::invalid("stream_manager", "stream index out of range")),
            StreamId::ReadOnly(_) => Err(StreamError::invalid("stream_manager", "stream is read-only")),
        }
    }

    fn entry(&self, id: StreamId) -> Result<&StreamEntry> {
        match id {
            StreamId::ReadWrite(idx) => self.rw_streams.get(idx as usize),
            StreamId::ReadOnly(idx) => self.ro_streams.get(idx as usize),
        }
        .ok_or_else(|| StreamError::invalid("stream_manager", "stream index out of range"))
    }

    /// Appends one item to a read-write stream; asserts the handle is in range and writable.
    /// `id` is the per-item 64-bit id resolved through the stream's own ID table — a stream can
    /// carry items for more than one id, the catalog `user_id` recorded at `register` is just
    /// the one used to name the file.
    pub fn write_item(&mut self, stream: StreamId, id: u64, time: u64, data: &[u8]) -> Result<()> {
        let entry = self.rw_entry_mut(stream)?;
        let sizeof_item = entry.file.sizeof_item();
        if sizeof_item != 0 && data.len() > sizeof_item as usize {
            return Err(StreamError::invalid("stream_manager::write_item", "payload exceeds sizeof_item"));
        }
        entry.file.write_item(time, id, data)
    }

    pub fn create_iterator(&self, id: StreamId) -> Result<StreamIterator<'_>> {
        Ok(self.entry(id)?.file.create_iterator())
    }

    pub fn stream_time(&self, id: StreamId) -> Result<(u64, u64)> {
        let entry = self.entry(id)?;
        Ok((entry.file.time_begin(), entry.file.time_end()))
    }

    pub fn stream_info(&self, id: StreamId) -> Result<u64> {
        Ok(self.entry(id)?.user_id)
    }

    pub fn path_of(&self, id: StreamId) -> Result<&Path> {
        Ok(&self.entry(id)?.path)
    }

    /// Syncs every read-write mapping.
    pub fn flush(&self) -> Result<()> {
        for entry in &self.rw_streams {
            entry.file.flush()?;
        }
        Ok(())
    }

    /// Reserved for periodic maintenance — throughput analysis and grow-by-rotate. Not yet
    /// implemented; intentionally a no-op rather than a silent partial behavior.
    // TODO: analyze per-stream throughput and rotate (close + create successor) streams that
    // are approaching capacity.
    pub fn update(&mut self, _now: u64) -> Result<()> {
        Ok(())
    }

    /// Syncs and closes every stream, in read-only-then-read-write order. Best-effort: a failure
    /// on one stream is logged and does not stop the rest from closing.
    pub fn destroy(self) {
        for entry in self.ro_streams {
            if let Err(e) = entry.file.close() {
                warn!(path = %entry.path.display(), error = %e, "stream_manager: error closing read-only stream");
            }
        }
        for entry in self.rw_streams {
            if let Err(e) = entry.file.close() {
                warn!(path = %entry.path.display(), error = %e, "stream_manager: error closing read-write stream");
            }
        }
    }
}

fn stem_of(path: &Path) -> Option<String> {
    path.file_stem().map(|s| s.to_string_lossy().into_owned())
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension().map(|e| e == ext).unwrap_or(false)
}

pub use crate::stream_file::Item as StreamItem;

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn tmp_dir(name: &str) -> PathBuf {
        let mut p = env::temp_dir();
        p.push(format!("streamkeep-test-manager-{}-{}", std::process::id(), name));
        p
    }

    #[test]
    fn register_creates_rwstream_under_basepath() {
        let base = tmp_dir("register_creates_rwstream_under_basepath");
        let _ = fs::remove_dir_all(&base);
        let mut m = StreamManager::open(&base).unwrap();

        let id = m.register(StreamKind::VariableData, "alpha", 0x001122334455, 64 * 1024, 0, 4, 16).unwrap();
        m.write_item(id, 0x001122334455, 1000, &[1, 2, 3]).unwrap();

        let (begin, end) = m.stream_time(id).unwrap();
        assert_eq!((begin, end), (1000, 1000));
        assert_eq!(m.stream_info(id).unwrap(), 0x001122334455);

        let path = m.path_of(id).unwrap().to_path_buf();
        assert!(path.exists());
        assert_eq!(path.extension().unwrap(), "rwstream");

        m.destroy();
        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn rescanning_basepath_adopts_existing_stream() {
        let base = tmp_dir("rescanning_basepath_adopts_existing_stream");
        let _ = fs::remove_dir_all(&base);
        {
            let mut m = StreamManager::open(&base).unwrap();
            let id = m.register(StreamKind::VariableData, "beta", 42, 64 * 1024, 0, 4, 16).unwrap();
            m.write_item(id, 42, 5, &[9]).unwrap();
            m.destroy();
        }

        let m2 = StreamManager::open(&base).unwrap();
        assert_eq!(m2.rw_streams.len(), 1);
        let id = StreamId::ReadWrite(0);
        assert_eq!(m2.stream_info(id).unwrap(), 42);
        let (begin, _) = m2.stream_time(id).unwrap();
        assert_eq!(begin, 5);

        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn user_index_increments_per_user_id() {
        let base = tmp_dir("user_index_increments_per_user_id");
        let _ = fs::remove_dir_all(&base);
        let mut m = StreamManager::open(&base).unwrap();

        let id1 = m.register(StreamKind::VariableData, "s1", 7, 64 * 1024, 0, 4, 16).unwrap();
        let id2 = m.register(StreamKind::VariableData, "s2", 7, 64 * 1024, 0, 4, 16).unwrap();
        assert_eq!(m.rw_streams[0].user_index, 1);
        assert_eq!(m.rw_streams[1].user_index, 2);
        let _ = (id1, id2);

        m.destroy();
        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn write_to_readonly_handle_fails() {
        let base = tmp_dir("write_to_readonly_handle_fails");
        let _ = fs::remove_dir_all(&base);
        let mut m = StreamManager::open(&base).unwrap();
        let err = m.write_item(StreamId::ReadOnly(0), 1, 1, &[0]).unwrap_err();
        assert!(matches!(err, StreamError::InvalidArgument { .. }));

        m.destroy();
        let _ = fs::remove_dir_all(&base);
    }
}
