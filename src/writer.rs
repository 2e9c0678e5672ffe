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

//! Thin, strongly-typed write API (C8) over a single stream handle. Every
//! encoder writes little-endian; `write_f32` bit-reinterprets the value as
//! `u32` before emission.

use crate::error::Result;
use crate::stream_manager::{StreamId, StreamManager};

pub struct StreamWriter<'a> {
    manager: &'a mut StreamManager,
    stream: StreamId,
}

impl<'a> StreamWriter<'a> {
    pub fn new(manager: &'a mut StreamManager, stream: StreamId) -> Self {
        Self { manager, stream }
    }

    /// Fixed- or variable-data write; `size` must fit the stream's `sizeof_item` for fixed
    /// streams, enforced by `StreamManager::write_item`.
    pub fn write_data(&mut self, id: u64, time: u64, bytes: &[u8]) -> Result<()> {
        self.manager.write_item(self.stream, id, time, bytes)
    }

    pub fn write_u8(&mut self, id: u64, time: u64, value: u8) -> Result<()> {
        self.write_data(id, time, &value.to_le_bytes())
    }

    pub fn write_u16(&mut self, id: u64, time: u64, value: u16) -> Result<()> {
        self.write_data(id, time, &value.to_le_bytes())
    }

    pub fn write_u32(&mut self, id: u64, time: u64, value: u32) -> Result<()> {
        self.write_data(id, time, &value.to_le_bytes())
    }

    pub fn write_f32(&mut self, id: u64, time: u64, value: f32) -> Result<()> {
        self.write_data(id, time, &value.to_bits().to_le_bytes())
    }

    pub fn stream_time(&self) -> Result<(u64, u64)> {
        self.manager.stream_time(self.stream)
    }

    pub fn stream_info(&self) -> Result<u64> {
        self.manager.stream_info(self.stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream_file::StreamKind;
    use std::{env, fs, path::PathBuf};

    fn tmp_dir(name: &str) -> PathBuf {
        let mut p = env::temp_dir();
        p.push(format!("streamkeep-test-writer-{}-{}", std::process::id(), name));
        p
    }

    #[test]
    fn typed_encoders_round_trip_little_endian() {
        let base = tmp_dir("typed_encoders_round_trip_little_endian");
        let _ = fs::remove_dir_all(&base);
        let mut manager = StreamManager::open(&base).unwrap();
        let id = manager.register(StreamKind::FixedU32, "scalar", 9, 64 * 1024, 4, 4, 16).unwrap();

        {
            let mut writer = StreamWriter::new(&mut manager, id);
            writer.write_u32(9, 100, 0xdead_beef).unwrap();
        }

        let it = manager.create_iterator(id).unwrap();
        let item = it.get_item(0).unwrap();
        assert_eq!(item.data, 0xdead_beef_u32.to_le_bytes());

        manager.destroy();
        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn write_f32_bit_reinterprets_value() {
        let base = tmp_dir("write_f32_bit_reinterprets_value");
        let _ = fs::remove_dir_all(&base);
        let mut manager = StreamManager::open(&base).unwrap();
        let id = manager.register(StreamKind::FixedF32, "floatstream", 1, 64 * 1024, 4, 4, 16).unwrap();

        {
            let mut writer = StreamWriter::new(&mut manager, id);
            writer.write_f32(1, 10, 1.5f32).unwrap();
        }

        let it = manager.create_iterator(id).unwrap();
        let item = it.get_item(0).unwrap();
        assert_eq!(item.data, 1.5f32.to_bits().to_le_bytes());

        manager.destroy();
        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn oversized_write_rejected_for_fixed_stream() {
        let base = tmp_dir("oversized_write_rejected_for_fixed_stream");
        let _ = fs::remove_dir_all(&base);
        let mut manager = StreamManager::open(&base).unwrap();
        let id = manager.register(StreamKind::FixedU8, "tiny", 1, 64 * 1024, 1, 4, 16).unwrap();

        let mut writer = StreamWriter::new(&mut manager, id);
        assert!(writer.write_u32(1, 0, 42).is_err());

        manager.destroy();
        let _ = fs::remove_dir_all(&base);
    }
}
