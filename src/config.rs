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

//! Declarative configuration: just enough for the core to find its base path
//! and mapping file and size its job manager. Parsing the decoder plugin
//! config and the network endpoint list is out of scope; `Config` only
//! covers what this crate's components consume.

use std::path::{Path, PathBuf};
use serde::Deserialize;
use crate::error::{Result, StreamError};

fn default_file_size() -> u64 {
    crate::util::DEFAULT_STREAM_FILE_SIZE
}

fn default_ids_capacity() -> u32 {
    16
}

fn default_avg_item_size() -> u32 {
    32
}

fn default_job_workers() -> usize {
    2
}

fn default_pending_capacity() -> usize {
    1024
}

fn default_mapping_reload_interval_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Directory holding `*.rwstream` at its root and `NN/*.rostream` subdirectories.
    pub basepath: PathBuf,

    /// Path to the `ID=NAME` mapping text file.
    pub mapping_path: PathBuf,

    /// Default byte size for a newly registered stream file.
    #[serde(default = "default_file_size")]
    pub file_size: u64,

    /// Default ID-table capacity for a newly registered stream file.
    #[serde(default = "default_ids_capacity")]
    pub ids_capacity: u32,

    /// Average item size hint, used by callers sizing a stream's `item_capacity` from its
    /// `file_size`.
    #[serde(default = "default_avg_item_size")]
    pub avg_item_size: u32,

    /// Worker threads backing the job manager (C4).
    #[serde(default = "default_job_workers")]
    pub job_workers: usize,

    /// Pending-ring capacity shared by every channel the job manager schedules from.
    #[serde(default = "default_pending_capacity")]
    pub job_pending_capacity: usize,

    /// How often (in milliseconds) the stream-request pipeline checks the mapping file's mtime.
    #[serde(default = "default_mapping_reload_interval_ms")]
    pub mapping_reload_interval_ms: u64,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| StreamError::io("read config file", e))?;
        serde_json::from_str(&text)
            .map_err(|e| StreamError::invalid("config::load", format!("malformed config at {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in_missing_fields() {
        let json = r#"{"basepath": "/tmp/streams", "mapping_path": "/tmp/mappings.txt"}"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.file_size, crate::util::DEFAULT_STREAM_FILE_SIZE);
        assert_eq!(cfg.ids_capacity, 16);
        assert_eq!(cfg.job_workers, 2);
        assert_eq!(cfg.mapping_reload_interval_ms, 10_000);
    }

    #[test]
    fn explicit_fields_override_defaults() {
        let json = r#"{
            "basepath": "/tmp/streams",
            "mapping_path": "/tmp/mappings.txt",
            "job_workers": 8
        }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.job_workers, 8);
    }
}
