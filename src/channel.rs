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

//! Fixed-capacity FIFO channel (C1). One mutex, two condvars (`not_empty`,
//! `not_full`) guarding a `VecDeque` with reserved capacity — Rust's
//! ownership model makes manual node recycling pointless busywork here.
//!
//! The channel never inspects or owns the bytes behind `T`; it only moves
//! values. Closing the channel is the only way `pop()` ever returns `None`.

use std::{
    collections::VecDeque,
    sync::{Mutex, Condvar},
};

struct State<T> {
    queue: VecDeque<T>,
    closed: bool,
}

pub struct Channel<T> {
    capacity: usize,
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> Channel<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "channel capacity must be positive");
        Self {
            capacity,
            state: Mutex::new(State { queue: VecDeque::with_capacity(capacity), closed: false }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Blocks while the channel is full. Returns `Err(item)` if the channel is closed, handing
    /// the item back to the caller since ownership never transferred.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.closed {
                return Err(item);
            }
            if state.queue.len() < self.capacity {
                break;
            }
            state = self.not_full.wait(state).unwrap();
        }
        state.queue.push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Blocks while the channel is empty. Returns `None` iff the channel is closed and drained.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(item) = state.queue.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            state = self.not_empty.wait(state).unwrap();
        }
    }

    /// Non-blocking pop: returns `None` immediately if the channel is currently empty, whether
    /// or not it is closed.
    pub fn try_pop(&self) -> Option<T> {
        let mut state = self.state.lock().unwrap();
        let item = state.queue.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Marks the channel closed and wakes every blocked producer/consumer. Queued items are
    /// still drainable via `pop()`/`try_pop()` afterwards; only `push()` starts failing.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        drop(state);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_per_producer() {
        let ch: Arc<Channel<i32>> = Arc::new(Channel::new(4));

        let ch_a = Arc::clone(&ch);
        let a = thread::spawn(move || {
            for v in [1, 2, 3] {
                ch_a.push(v).unwrap();
            }
        });
        a.join().unwrap();

        ch.push(4).unwrap();

        let mut got = Vec::new();
        for _ in 0..4 {
            got.push(ch.pop().unwrap());
        }
        // Items pushed by thread A must come out in order among themselves.
        let a_positions: Vec<usize> = got.iter().enumerate()
            .filter(|(_, &v)| v == 1 || v == 2 || v == 3)
            .map(|(i, _)| i)
            .collect();
        let a_values: Vec<i32> = a_positions.iter().map(|&i| got[i]).collect();
        assert_eq!(a_values, vec![1, 2, 3]);
        assert!(got.contains(&4));
    }

    #[test]
    fn try_pop_empty() {
        let ch: Channel<i32> = Channel::new(2);
        assert_eq!(ch.try_pop(), None);
        ch.push(1).unwrap();
        assert_eq!(ch.try_pop(), Some(1));
        assert_eq!(ch.try_pop(), None);
    }

    #[test]
    fn push_blocks_when_full() {
        let ch: Arc<Channel<i32>> = Arc::new(Channel::new(1));
        ch.push(1).unwrap();

        let ch2 = Arc::clone(&ch);
        let t = thread::spawn(move || {
            ch2.push(2).unwrap();
        });

        // Give the blocked pusher a moment, then drain to unblock it.
        thread::yield_now();
        assert_eq!(ch.pop(), Some(1));
        t.join().unwrap();
        assert_eq!(ch.pop(), Some(2));
    }

    #[test]
    fn close_wakes_blocked_pop() {
        let ch: Arc<Channel<i32>> = Arc::new(Channel::new(1));
        let ch2 = Arc::clone(&ch);
        let t = thread::spawn(move || ch2.pop());
        thread::yield_now();
        ch.close();
        assert_eq!(t.join().unwrap(), None);
    }

    #[test]
    fn push_after_close_fails() {
        let ch: Channel<i32> = Channel::new(1);
        ch.close();
        assert_eq!(ch.push(1), Err(1));
    }
}
