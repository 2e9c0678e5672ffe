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

//! User-id-to-name mapping file: UTF-8, line-oriented `ID=NAME` text.
//! `MappingTable` is the sorted, binary-searchable view the stream-request
//! pipeline (C7) queries; `MappingFileLoader` does the actual disk read,
//! skipping a reload when the file's mtime hasn't moved.
//!
//! `ID` is either 12 hex digits or a colon-separated MAC. `NAME` is ASCII, at
//! most 63 characters. Blank lines are ignored; a malformed line is rejected
//! on its own, the rest of the file still parses.

use std::{
    fs,
    path::{Path, PathBuf},
    time::SystemTime,
};
use tracing::warn;
use crate::error::{Result, StreamError};

pub const MAPPING_NAME_MAX_LEN: usize = 63;

fn parse_user_id(field: &str) -> Option<u64> {
    if let Some(stripped) = field.strip_prefix("0x") {
        return u64::from_str_radix(stripped, 16).ok();
    }
    if field.contains(':') {
        let mut bytes = [0u8; 6];
        let mut parts = field.split(':');
        for byte in bytes.iter_mut() {
            *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
        }
        if parts.next().is_some() {
            return None;
        }
        return Some(bytes.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64));
    }
    if field.len() == 12 && field.bytes().all(|b| b.is_ascii_hexdigit()) {
        return u64::from_str_radix(field, 16).ok();
    }
    None
}

fn parse_name(field: &str) -> Option<String> {
    if field.is_empty() || !field.is_ascii() {
        return None;
    }
    let truncated: String = field.chars().take(MAPPING_NAME_MAX_LEN).collect();
    Some(truncated)
}

fn parse_line(line: &str) -> Option<(u64, String)> {
    let (id_field, name_field) = line.split_once('=')?;
    let user_id = parse_user_id(id_field.trim())?;
    let name = parse_name(name_field.trim())?;
    Some((user_id, name))
}

/// Parses mapping-file text into `(user_id, name)` pairs, dropping malformed lines with a
/// warning rather than failing the whole file.
pub fn parse_mappings_text(text: &str) -> Vec<(u64, String)> {
    let mut out = Vec::new();
    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        match parse_line(line) {
            Some(pair) => out.push(pair),
            None => warn!(line = lineno + 1, "mapping: skipping unparsable line"),
        }
    }
    out
}

/// Sorted `(user_id, name)` view supporting binary search on `user_id`. `version` increments
/// every time a merge actually adds an entry, so in-flight stream requests can tell whether the
/// mapping they resolved against is still live.
#[derive(Default)]
pub struct MappingTable {
    entries: Vec<(u64, String)>,
    version: u64,
}

impl MappingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find(&self, user_id: u64) -> Option<&str> {
        self.entries
            .binary_search_by_key(&user_id, |&(id, _)| id)
            .ok()
            .map(|idx| self.entries[idx].1.as_str())
    }

    /// Adds every `(user_id, name)` pair not already present, then re-sorts once. Bumps
    /// `version` iff at least one entry was actually new.
    pub fn merge(&mut self, additions: &[(u64, String)]) {
        let before = self.entries.len();
        for (user_id, name) in additions {
            if self.find(*user_id).is_none() {
                self.entries.push((*user_id, name.clone()));
            }
        }
        if self.entries.len() > before {
            self.entries.sort_unstable_by_key(|&(id, _)| id);
            self.version += 1;
        }
    }
}

/// Reloads a mapping file only when its mtime has changed since the last successful reload.
pub struct MappingFileLoader {
    path: PathBuf,
    last_mtime: Option<SystemTime>,
}

impl MappingFileLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), last_mtime: None }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `Ok(Some(pairs))` if the file changed and was reloaded, `Ok(None)` if the mtime
    /// is unchanged (round-trip law: "if the mapping file is unchanged... the merged view is
    /// byte-identical", which holds trivially when we skip the reload outright).
    pub fn reload_if_changed(&mut self) -> Result<Option<Vec<(u64, String)>>> {
        let metadata = match fs::metadata(&self.path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StreamError::io("stat mapping file", e)),
        };
        let mtime = metadata.modified().map_err(|e| StreamError::io("stat mapping file mtime", e))?;
        if Some(mtime) == self.last_mtime {
            return Ok(None);
        }

        let text = fs::read_to_string(&self.path).map_err(|e| StreamError::io("read mapping file", e))?;
        self.last_mtime = Some(mtime);
        Ok(Some(parse_mappings_text(&text)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_hex_and_colon_ids() {
        let pairs = parse_mappings_text("001122334455=alpha\nAA:BB:CC:DD:EE:FF=beta\n");
        assert_eq!(pairs, vec![
            (0x001122334455, "alpha".to_string()),
            (0xAABBCCDDEEFF, "beta".to_string()),
        ]);
    }

    #[test]
    fn blank_lines_and_bad_lines_are_skipped() {
        let pairs = parse_mappings_text("\n  \nnotanid=foo\n001122334455=ok\n");
        assert_eq!(pairs, vec![(0x001122334455, "ok".to_string())]);
    }

    #[test]
    fn name_is_truncated_to_max_len() {
        let long = "x".repeat(100);
        let pairs = parse_mappings_text(&format!("001122334455={long}"));
        assert_eq!(pairs[0].1.len(), MAPPING_NAME_MAX_LEN);
    }

    #[test]
    fn table_find_uses_binary_search_after_merge() {
        let mut table = MappingTable::new();
        table.merge(&[(3, "c".into()), (1, "a".into()), (2, "b".into())]);
        assert_eq!(table.find(1), Some("a"));
        assert_eq!(table.find(2), Some("b"));
        assert_eq!(table.find(3), Some("c"));
        assert_eq!(table.find(4), None);
        assert_eq!(table.version(), 1);
    }

    #[test]
    fn merge_with_no_new_entries_does_not_bump_version() {
        let mut table = MappingTable::new();
        table.merge(&[(1, "a".into())]);
        assert_eq!(table.version(), 1);
        table.merge(&[(1, "a-again".into())]);
        assert_eq!(table.version(), 1);
        assert_eq!(table.find(1), Some("a"));
    }

    #[test]
    fn loader_skips_reload_when_mtime_unchanged() {
        let mut path = std::env::temp_dir();
        path.push(format!("streamkeep-test-mapping-{}.txt", std::process::id()));
        {
            let mut f = fs::File::create(&path).unwrap();
            writeln!(f, "001122334455=alpha").unwrap();
        }
        let mut loader = MappingFileLoader::new(&path);
        let first = loader.reload_if_changed().unwrap();
        assert!(first.is_some());
        let second = loader.reload_if_changed().unwrap();
        assert!(second.is_none());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn loader_reports_missing_file_as_no_change() {
        let mut path = std::env::temp_dir();
        path.push(format!("streamkeep-test-mapping-missing-{}.txt", std::process::id()));
        let _ = fs::remove_file(&path);
        let mut loader = MappingFileLoader::new(&path);
        assert!(loader.reload_if_changed().unwrap().is_none());
    }
}
