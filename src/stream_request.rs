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

//! Creates new stream files off the event-loop thread (C7), using the job
//! manager (C4) as its executor. One `JobManager<JobPayload>` instance backs
//! two channels: a 2-slot mappings channel and a 256-slot stream-request
//! channel, matching the capacities the mapping reload and creation workloads
//! were sized for.
//!
//! Both channels carry the same completion payload type — `JobPayload` — an
//! enum rather than two separate `JobManager`s, since the two workloads still
//! want a single pool of worker threads and a single `stop()` to shut both
//! down together.
//!
//! Stream-file creation itself never touches `StreamManager`: the worker only
//! needs a path and the file parameters, both resolved on the control thread
//! beforehand (`StreamManager::next_user_index`/`build_rw_path`), because the
//! catalog arrays are control-thread-only state. The control thread adopts
//! the finished `StreamFile` into the catalog when the job completes.

use std::{collections::HashMap, path::PathBuf, sync::Arc};
use slab::Slab;
use tracing::warn;

use crate::error::{Result, StreamError};
use crate::job_manager::{ChannelId, JobManager};
use crate::mapping::{MappingFileLoader, MappingTable};
use crate::stream_file::{StreamFile, StreamKind};
use crate::stream_manager::{StreamId, StreamManager};
use crate::util::now_millis;

/// Upper bound on slots in flight at once, matching the stream-request channel's capacity: a
/// slot is never "done" for longer than it takes the producer to call `pop_done`.
pub const MAX_PENDING_REQUESTS: usize = 256;

const MAPPING_CHANNELS: usize = 2;
const MAPPING_RELOAD_INTERVAL_MS: u64 = 10_000;

struct MappingReloadPayload {
    loader: MappingFileLoader,
    reloaded: Option<Vec<(u64, String)>>,
}

struct CreationPayload {
    slot: usize,
    user_id: u64,
    user_index: u16,
    name: String,
    path: PathBuf,
    stream_type: StreamKind,
    sizeof_item: u32,
    ids_capacity: u32,
    item_capacity: u32,
    file_size: u64,
    outcome: Option<Result<StreamFile>>,
}

/// Shared completion payload for both channels this pipeline owns.
pub enum JobPayload {
    MappingReload(MappingReloadPayload),
    StreamCreate(CreationPayload),
}

fn mapping_reload_job_fn(payload: &mut JobPayload) {
    let JobPayload::MappingReload(p) = payload else {
        return;
    };
    match p.loader.reload_if_changed() {
        Ok(reloaded) => p.reloaded = reloaded,
        Err(e) => {
            warn!(error = %e, path = %p.loader.path().display(), "stream_request: mapping reload failed");
            p.reloaded = None;
        }
    }
}

fn stream_create_job_fn(payload: &mut JobPayload) {
    let JobPayload::StreamCreate(p) = payload else {
        return;
    };
    p.outcome = Some(StreamFile::create_typed(
        &p.path,
        &p.name,
        now_millis(),
        p.ids_capacity,
        p.item_capacity,
        p.file_size,
        p.stream_type,
        p.sizeof_item,
    ));
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum SlotState {
    WaitingForMapping,
    Submitted,
    Done,
}

struct PendingRequest {
    user_id: u64,
    stream_type: StreamKind,
    sizeof_item: u32,
    ids_capacity: u32,
    item_capacity: u32,
    file_size: u64,
}

struct RequestSlot {
    request: PendingRequest,
    state: SlotState,
    result: Option<Result<StreamId>>,
}

/// Pipeline state: the double-buffered mapping view and the free/active/done request slots.
/// Slot allocation itself is `slab::Slab`, the same free-list structure `pool.rs` already uses
/// — it subsumes the hand-rolled free-list array, leaving only `Active` vs `Done` as state
/// this type has to track.
pub struct StreamRequestPipeline {
    job_manager: Arc<JobManager<JobPayload>>,
    mappings_channel: ChannelId,
    stream_request_channel: ChannelId,
    /// `None` while a reload is in flight with the job manager, so a second reload can't be
    /// submitted on top of one still running.
    mapping_buffer: Option<MappingReloadPayload>,
    active_mapping: MappingTable,
    last_mapping_check_ms: u64,
    requests: Slab<RequestSlot>,
    /// One past the highest `user_index` handed out per `user_id` that hasn't been adopted into
    /// the catalog yet. `StreamManager::next_user_index` only sees already-adopted streams, so
    /// two requests for the same `user_id` resolving in quick succession would otherwise both
    /// read the same catalog-derived index before either's creation job completes.
    reserved_user_index: HashMap<u64, u16>,
}

impl StreamRequestPipeline {
    pub fn new(job_manager: Arc<JobManager<JobPayload>>, mapping_path: impl Into<PathBuf>) -> Result<Self> {
        let mappings_channel = job_manager.init_channel(2, MAPPING_CHANNELS)?;
        let stream_request_channel = job_manager.init_channel(MAX_PENDING_REQUESTS, MAPPING_CHANNELS)?;
        Ok(Self {
            job_manager,
            mappings_channel,
            stream_request_channel,
            mapping_buffer: Some(MappingReloadPayload {
                loader: MappingFileLoader::new(mapping_path),
                reloaded: None,
            }),
            active_mapping: MappingTable::new(),
            last_mapping_check_ms: 0,
            requests: Slab::with_capacity(MAX_PENDING_REQUESTS),
            reserved_user_index: HashMap::new(),
        })
    }

    /// Queues a new stream for creation once `user_id` resolves to a name.
    pub fn push_request(
        &mut self,
        user_id: u64,
        stream_type: StreamKind,
        sizeof_item: u32,
        ids_capacity: u32,
        item_capacity: u32,
        file_size: u64,
    ) -> Result<()> {
        if self.requests.len() >= MAX_PENDING_REQUESTS {
            return Err(StreamError::CapacityExceeded { what: "stream request slots", capacity: MAX_PENDING_REQUESTS });
        }
        self.requests.insert(RequestSlot {
            request: PendingRequest { user_id, stream_type, sizeof_item, ids_capacity, item_capacity, file_size },
            state: SlotState::WaitingForMapping,
            result: None,
        });
        Ok(())
    }

    /// Drives the pipeline one tick: reload the mapping file if due, drain whatever jobs
    /// finished, and submit any newly-resolvable requests.
    pub fn update(&mut self, now_ms: u64, stream_manager: &mut StreamManager) {
        self.poll_mapping_reload(now_ms);
        self.drain_mapping_completions();
        self.drain_creation_completions(stream_manager);
        self.submit_ready_requests(stream_manager);
    }

    /// Harvests one finished request, removing its slot. Returns `(user_id, outcome)`; a
    /// creation failure is surfaced rather than hidden.
    pub fn pop_done(&mut self) -> Option<(u64, Result<StreamId>)> {
        let key = self.requests.iter().find(|(_, slot)| slot.state == SlotState::Done).map(|(key, _)| key)?;
        let slot = self.requests.remove(key);
        Some((slot.request.user_id, slot.result.expect("Done slot always carries a result")))
    }

    pub fn active_request_count(&self) -> usize {
        self.requests.len()
    }

    fn poll_mapping_reload(&mut self, now_ms: u64) {
        if now_ms < self.last_mapping_check_ms + MAPPING_RELOAD_INTERVAL_MS {
            return;
        }
        let Some(payload) = self.mapping_buffer.take() else {
            return; // a reload is already in flight
        };
        self.last_mapping_check_ms = now_ms;
        let path = payload.loader.path().to_path_buf();
        if let Err(e) = self.job_manager.submit(self.mappings_channel, mapping_reload_job_fn, JobPayload::MappingReload(payload)) {
            warn!(error = %e, "stream_request: failed to submit mapping reload job");
            self.mapping_buffer = Some(MappingReloadPayload { loader: MappingFileLoader::new(path), reloaded: None });
        }
    }

    fn drain_mapping_completions(&mut self) {
        while let Some(job) = self.job_manager.pop_completed(self.mappings_channel) {
            let JobPayload::MappingReload(payload) = job else {
                continue;
            };
            if let Some(additions) = &payload.reloaded {
                self.active_mapping.merge(additions);
            }
            self.mapping_buffer = Some(MappingReloadPayload { loader: payload.loader, reloaded: None });
        }
    }

    fn drain_creation_completions(&mut self, stream_manager: &mut StreamManager) {
        while let Some(job) = self.job_manager.pop_completed(self.stream_request_channel) {
            let JobPayload::StreamCreate(payload) = job else {
                continue;
            };
            let key = payload.slot;
            let result = match payload.outcome {
                Some(Ok(file)) => Ok(stream_manager.adopt_created(file, payload.path, payload.user_id, payload.user_index)),
                Some(Err(e)) => Err(e),
                None => Err(StreamError::invariant("stream_request", "creation job completed without an outcome")),
            };
            if let Some(slot) = self.requests.get_mut(key) {
                slot.result = Some(result);
                slot.state = SlotState::Done;
            }
        }
    }

    fn submit_ready_requests(&mut self, stream_manager: &StreamManager) {
        let active_mapping = &self.active_mapping;
        let ready: Vec<(usize, String)> = self
            .requests
            .iter()
            .filter(|(_, slot)| slot.state == SlotState::WaitingForMapping)
            .filter_map(|(key, slot)| active_mapping.find(slot.request.user_id).map(|name| (key, name.to_string())))
            .collect();

        for (key, name) in ready {
            let (stream_type, sizeof_item, ids_capacity, item_capacity, file_size, user_id) = {
                let slot = &self.requests[key];
                (
                    slot.request.stream_type,
                    slot.request.sizeof_item,
                    slot.request.ids_capacity,
                    slot.request.item_capacity,
                    slot.request.file_size,
                    slot.request.user_id,
                )
            };
            let catalog_next = stream_manager.next_user_index(user_id);
            let reserved_next = self.reserved_user_index.get(&user_id).copied().unwrap_or(0);
            let user_index = catalog_next.max(reserved_next);
            self.reserved_user_index.insert(user_id, user_index + 1);
            let path = stream_manager.build_rw_path(user_id, user_index, &name);

            self.requests[key].state = SlotState::Submitted;
            let payload = JobPayload::StreamCreate(CreationPayload {
                slot: key,
                user_id,
                user_index,
                name,
                path,
                stream_type,
                sizeof_item,
                ids_capacity,
                item_capacity,
                file_size,
                outcome: None,
            });

            if let Err(e) = self.job_manager.submit(self.stream_request_channel, stream_create_job_fn, payload) {
                warn!(error = %e, "stream_request: failed to submit stream-creation job");
                self.requests[key].state = SlotState::Done;
                self.requests[key].result = Some(Err(e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, io::Write};

    fn tmp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("streamkeep-test-request-{}-{}", std::process::id(), name));
        p
    }

    fn write_mapping(path: &std::path::Path, lines: &str) {
        let mut f = fs::File::create(path).unwrap();
        write!(f, "{lines}").unwrap();
    }

    #[test]
    fn request_is_created_once_mapping_resolves() {
        let base = tmp_dir("request_is_created_once_mapping_resolves");
        let _ = fs::remove_dir_all(&base);
        let mut stream_manager = StreamManager::open(&base).unwrap();

        let mapping_path = base.join("mappings.txt");
        fs::create_dir_all(&base).unwrap();
        write_mapping(&mapping_path, "001122334455=alpha\n");

        let jm = Arc::new(JobManager::<JobPayload>::new(2, 16));
        let mut pipeline = StreamRequestPipeline::new(Arc::clone(&jm), &mapping_path).unwrap();

        pipeline.push_request(0x001122334455, StreamKind::VariableData, 0, 4, 16, 64 * 1024).unwrap();

        // Tick far enough forward that the mapping reload is due, then let the jobs settle.
        let mut now = MAPPING_RELOAD_INTERVAL_MS;
        let mut stream_id = None;
        for _ in 0..50 {
            pipeline.update(now, &mut stream_manager);
            if let Some((user_id, result)) = pipeline.pop_done() {
                assert_eq!(user_id, 0x001122334455);
                stream_id = Some(result.unwrap());
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
            now += MAPPING_RELOAD_INTERVAL_MS;
        }

        let id = stream_id.expect("request should have completed");
        assert!(matches!(id, StreamId::ReadWrite(_)));
        assert_eq!(stream_manager.stream_info(id).unwrap(), 0x001122334455);

        jm.stop(true);
        stream_manager.destroy();
        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn request_stays_pending_without_a_mapping() {
        let base = tmp_dir("request_stays_pending_without_a_mapping");
        let _ = fs::remove_dir_all(&base);
        let mut stream_manager = StreamManager::open(&base).unwrap();
        let mapping_path = base.join("mappings.txt");
        fs::create_dir_all(&base).unwrap();
        write_mapping(&mapping_path, "");

        let jm = Arc::new(JobManager::<JobPayload>::new(1, 16));
        let mut pipeline = StreamRequestPipeline::new(Arc::clone(&jm), &mapping_path).unwrap();
        pipeline.push_request(0xDEADBEEF, StreamKind::VariableData, 0, 4, 16, 64 * 1024).unwrap();

        pipeline.update(MAPPING_RELOAD_INTERVAL_MS, &mut stream_manager);
        std::thread::sleep(std::time::Duration::from_millis(20));
        pipeline.update(MAPPING_RELOAD_INTERVAL_MS, &mut stream_manager);

        assert!(pipeline.pop_done().is_none());
        assert_eq!(pipeline.active_request_count(), 1);

        jm.stop(true);
        stream_manager.destroy();
        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn push_beyond_capacity_fails() {
        let base = tmp_dir("push_beyond_capacity_fails");
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        let mapping_path = base.join("mappings.txt");
        write_mapping(&mapping_path, "");

        let jm = Arc::new(JobManager::<JobPayload>::new(1, 16));
        let mut pipeline = StreamRequestPipeline::new(jm, &mapping_path).unwrap();
        for i in 0..MAX_PENDING_REQUESTS {
            pipeline.push_request(i as u64, StreamKind::VariableData, 0, 4, 16, 64 * 1024).unwrap();
        }
        assert!(pipeline.push_request(999, StreamKind::VariableData, 0, 4, 16, 64 * 1024).is_err());
        let _ = fs::remove_dir_all(&base);
    }
}
