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

//! Worker pool executing opaque jobs with per-channel completion delivery
//! (C4). Jobs carry a generic completion payload `C` per `JobManager<C>`,
//! with one completion ring per registered channel — a `JobManager` instance
//! is shared by jobs that all complete with the same payload type (the
//! stream-request pipeline is the one consumer in this crate; each slot it
//! submits carries the state the worker mutates and then hands back as the
//! completion token).
//!
//! Back-pressure is applied to workers, not submitters: `submit()` is
//! non-blocking and fails on a full pending ring, but a worker that finishes
//! a job blocks on `room_completed` until its completion ring has room, so no
//! successfully-started job's completion is ever silently dropped.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, Condvar},
    thread::{self, JoinHandle},
};
use tracing::{debug, warn};
use crate::error::StreamError;

pub type ChannelId = usize;

type JobFn<C> = Box<dyn FnOnce(&mut C) + Send>;

struct Job<C> {
    channel_id: ChannelId,
    func: JobFn<C>,
    payload: C,
}

struct CompletionRing<C> {
    ring: VecDeque<C>,
    capacity: usize,
}

struct Inner<C> {
    pending: VecDeque<Job<C>>,
    pending_capacity: usize,
    completions: Vec<CompletionRing<C>>,
    stopping: bool,
}

struct Shared<C> {
    mutex: Mutex<Inner<C>>,
    has_jobs: Condvar,
    has_completed: Condvar,
    room_completed: Condvar,
}

pub struct JobManager<C: Send + 'static> {
    shared: Arc<Shared<C>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<C: Send + 'static> JobManager<C> {
    /// Shared via `Arc` between producer threads and whichever thread eventually calls
    /// `stop()` — `submit`/`pop_completed*` take `&self` so any holder of the `Arc` can use
    /// them concurrently with a `stop()` call from another holder.
    pub fn new(num_workers: usize, pending_capacity: usize) -> Self {
        assert!(num_workers >= 1, "job manager needs at least one worker");
        assert!(pending_capacity >= 1, "pending ring capacity must be positive");

        let shared = Arc::new(Shared {
            mutex: Mutex::new(Inner {
                pending: VecDeque::with_capacity(pending_capacity),
                pending_capacity,
                completions: Vec::new(),
                stopping: false,
            }),
            has_jobs: Condvar::new(),
            has_completed: Condvar::new(),
            room_completed: Condvar::new(),
        });

        let workers = (0..num_workers)
            .map(|worker_id| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("job-worker-{worker_id}"))
                    .spawn(move || worker_loop(shared))
                    .expect("failed to spawn job worker thread")
            })
            .collect();

        Self { shared, workers: Mutex::new(workers) }
    }

    /// Allocates a new completion ring, returning its `ChannelId`. Fails if the caller already
    /// registered as many channels as the pre-declared maximum (checked by `max_channels`).
    pub fn init_channel(&self, capacity: usize, max_channels: usize) -> Result<ChannelId, StreamError> {
        assert!(capacity >= 1, "completion ring capacity must be positive");
        let mut inner = self.shared.mutex.lock().unwrap();
        if inner.completions.len() >= max_channels {
            return Err(StreamError::CapacityExceeded { what: "job manager channels", capacity: max_channels });
        }
        inner.completions.push(CompletionRing { ring: VecDeque::with_capacity(capacity), capacity });
        Ok(inner.completions.len() - 1)
    }

    /// Non-blocking push to the pending ring. Fails if stopping or the ring is full.
    pub fn submit(
        &self,
        channel_id: ChannelId,
        func: impl FnOnce(&mut C) + Send + 'static,
        payload: C,
    ) -> Result<(), StreamError> {
        let mut inner = self.shared.mutex.lock().unwrap();
        if inner.stopping {
            return Err(StreamError::Stopped { op: "job_manager::submit" });
        }
        if inner.pending.len() >= inner.pending_capacity {
            return Err(StreamError::CapacityExceeded { what: "job manager pending ring", capacity: inner.pending_capacity });
        }
        inner.pending.push_back(Job { channel_id, func: Box::new(func), payload });
        drop(inner);
        self.shared.has_jobs.notify_one();
        Ok(())
    }

    /// Non-blocking pop of a completed job's payload.
    pub fn pop_completed(&self, channel_id: ChannelId) -> Option<C> {
        let mut inner = self.shared.mutex.lock().unwrap();
        let item = inner.completions[channel_id].ring.pop_front();
        if item.is_some() {
            drop(inner);
            self.shared.room_completed.notify_all();
        }
        item
    }

    /// Blocks until a completion is available, or until the manager is stopping with an empty
    /// pending ring (no further completions will ever arrive for anyone).
    pub fn pop_completed_wait(&self, channel_id: ChannelId) -> Option<C> {
        let mut inner = self.shared.mutex.lock().unwrap();
        loop {
            if let Some(item) = inner.completions[channel_id].ring.pop_front() {
                drop(inner);
                self.shared.room_completed.notify_all();
                return Some(item);
            }
            if inner.stopping && inner.pending.is_empty() {
                return None;
            }
            inner = self.shared.has_completed.wait(inner).unwrap();
        }
    }

    pub fn pending_len(&self) -> usize {
        self.shared.mutex.lock().unwrap().pending.len()
    }

    /// `drain = true` finishes all queued jobs before workers exit; `drain = false` discards the
    /// pending ring immediately. In both cases, a job a worker has already popped always has its
    /// completion delivered — `drop` only discards jobs that never started. Idempotent: a second
    /// call is a no-op.
    pub fn stop(&self, drain: bool) {
        {
            let mut inner = self.shared.mutex.lock().unwrap();
            if inner.stopping {
                return;
            }
            inner.stopping = true;
            if !drain {
                let dropped = inner.pending.len();
                inner.pending.clear();
                if dropped > 0 {
                    warn!(dropped, "job_manager: dropping queued jobs on stop(drop)");
                }
            }
        }
        self.shared.has_jobs.notify_all();
        self.shared.has_completed.notify_all();
        self.shared.room_completed.notify_all();

        let mut workers = self.workers.lock().unwrap();
        for worker in workers.drain(..) {
            let _ = worker.join();
        }
        debug!("job_manager: all workers joined");
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.mutex.lock().unwrap().stopping
    }
}

fn worker_loop<C: Send + 'static>(shared: Arc<Shared<C>>) {
    loop {
        let mut inner = shared.mutex.lock().unwrap();
        while inner.pending.is_empty() && !inner.stopping {
            inner = shared.has_jobs.wait(inner).unwrap();
        }

        if inner.stopping && inner.pending.is_empty() {
            return;
        }

        let mut job = inner.pending.pop_front().expect("pending checked non-empty above");
        drop(inner);

        (job.func)(&mut job.payload);

        let mut inner = shared.mutex.lock().unwrap();
        loop {
            let ring = &mut inner.completions[job.channel_id];
            if ring.ring.len() < ring.capacity {
                ring.ring.push_back(job.payload);
                break;
            }
            inner = shared.room_completed.wait(inner).unwrap();
        }
        drop(inner);
        shared.has_completed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn submit_then_drain_delivers_every_completion() {
        let jm: JobManager<usize> = JobManager::new(4, 256);
        let ch = jm.init_channel(256, 8).unwrap();

        for i in 0..100 {
            jm.submit(ch, |_| {}, i).unwrap();
        }

        let mut seen: Vec<usize> = (0..100).map(|_| jm.pop_completed_wait(ch).unwrap()).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());

        jm.stop(true);
    }

    #[test]
    fn submit_executes_function_before_completion() {
        let jm: JobManager<Arc<AtomicUsize>> = JobManager::new(2, 16);
        let ch = jm.init_channel(16, 4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        jm.submit(ch, |c| { c.fetch_add(1, Ordering::SeqCst); }, Arc::clone(&counter)).unwrap();

        let done = jm.pop_completed_wait(ch).unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 1);
        jm.stop(true);
    }

    #[test]
    fn submit_after_stop_fails() {
        let jm: JobManager<()> = JobManager::new(1, 4);
        let ch = jm.init_channel(4, 4).unwrap();
        jm.stop(true);
        assert!(jm.submit(ch, |_| {}, ()).is_err());
    }

    #[test]
    fn drop_mode_discards_unstarted_jobs() {
        let jm: JobManager<usize> = JobManager::new(1, 16);
        let ch = jm.init_channel(16, 4).unwrap();
        for i in 0..8 {
            jm.submit(ch, |_| {}, i).unwrap();
        }
        jm.stop(false);
        // At least some jobs may still have completed before the drop took effect, but the
        // manager must not hang waiting for ones it discarded.
        while jm.pop_completed(ch).is_some() {}
    }
}
