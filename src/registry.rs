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

//! Sharded user-id registry (C3): maps external 64-bit user-ids (typically a
//! MAC address) to a dense, small stream-id. Mutated only from the control
//! thread; no internal locking.
//!
//! Shard selection uses bits 32 and above of the user-id, masked by
//! `shard_count - 1`. Insertion keeps `user_ids[shard[i]]` strictly
//! increasing across `i` within each shard, via sorted insertion rather than
//! appending and re-sorting.

const INITIAL_SHARD_CAPACITY: usize = 4;

#[derive(Default)]
struct Shard {
    /// Indices into `user_ids`, sorted so that `user_ids[sorted[i]]` is increasing.
    sorted: Vec<u32>,
}

impl Shard {
    fn find(&self, user_ids: &[u64], user_id: u64) -> Option<u32> {
        self.sorted.iter()
            .copied()
            .find(|&idx| user_ids[idx as usize] == user_id)
    }

    /// Inserts `index` (the position `user_id` now occupies in the dense array) keeping
    /// `sorted` ordered by the user-id it points at.
    fn insert(&mut self, user_ids: &[u64], index: u32) {
        let user_id = user_ids[index as usize];
        let pos = self.sorted.partition_point(|&idx| user_ids[idx as usize] < user_id);
        self.sorted.insert(pos, index);
    }
}

pub struct UserIdRegistry {
    user_ids: Vec<u64>,
    capacity: usize,
    shard_bits: u32,
    shards: Vec<Shard>,
}

impl UserIdRegistry {
    pub fn new(capacity: usize, shard_bits: u32) -> Self {
        assert!(shard_bits <= 31, "shard_bits must fit the shard-count mask");
        let shard_count = 1usize << shard_bits;
        Self {
            user_ids: Vec::with_capacity(capacity),
            capacity,
            shard_bits,
            shards: (0..shard_count)
                .map(|_| Shard { sorted: Vec::with_capacity(INITIAL_SHARD_CAPACITY) })
                .collect(),
        }
    }

    fn shard_index(&self, user_id: u64) -> usize {
        let shard_count = self.shards.len() as u64;
        ((user_id >> 32) & (shard_count - 1)) as usize
    }

    pub fn len(&self) -> usize {
        self.user_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.user_ids.is_empty()
    }

    /// Returns the existing stream id for `user_id`, or registers it as a new one. Fails only
    /// when the dense array is already at `capacity`.
    pub fn register(&mut self, user_id: u64) -> Option<u32> {
        if let Some(id) = self.find(user_id) {
            return Some(id);
        }
        if self.user_ids.len() >= self.capacity {
            return None;
        }

        let index = self.user_ids.len() as u32;
        self.user_ids.push(user_id);
        let shard_index = self.shard_index(user_id);
        self.shards[shard_index].insert(&self.user_ids, index);
        Some(index)
    }

    pub fn find(&self, user_id: u64) -> Option<u32> {
        let shard_index = self.shard_index(user_id);
        self.shards[shard_index].find(&self.user_ids, user_id)
    }

    pub fn user_id(&self, id: u32) -> Option<u64> {
        self.user_ids.get(id as usize).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent() {
        let mut reg = UserIdRegistry::new(16, 2);
        let id1 = reg.register(0x0000_0001_0000_0000).unwrap();
        let id2 = reg.register(0x0000_0002_0000_0000).unwrap();
        let id3 = reg.register(0x0000_0003_0000_0000).unwrap();
        let id1_again = reg.register(0x0000_0001_0000_0000).unwrap();

        assert_eq!((id1, id2, id3, id1_again), (0, 1, 2, 0));
        assert_eq!(reg.len(), 3);
    }

    #[test]
    fn shard_selection_uses_high_bits() {
        let mut reg = UserIdRegistry::new(16, 2);
        // Differ only in bits 32..34 -> land in different shards.
        let a = 0x0000_0000_0000_0001u64;
        let b = 0x0000_0001_0000_0001u64;
        reg.register(a).unwrap();
        reg.register(b).unwrap();
        assert_eq!(reg.shard_index(a), 0);
        assert_eq!(reg.shard_index(b), 1);
    }

    #[test]
    fn shard_stays_sorted_by_user_id() {
        let mut reg = UserIdRegistry::new(16, 0); // single shard
        for uid in [5u64, 1, 3, 2, 4] {
            reg.register(uid << 32).unwrap();
        }
        let shard = &reg.shards[0];
        let ids: Vec<u64> = shard.sorted.iter().map(|&idx| reg.user_ids[idx as usize]).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn capacity_exhausted_returns_none() {
        let mut reg = UserIdRegistry::new(1, 1);
        assert!(reg.register(1).is_some());
        assert!(reg.register(2).is_none());
    }

    #[test]
    fn find_absent_returns_none() {
        let reg = UserIdRegistry::new(4, 1);
        assert_eq!(reg.find(0x42), None);
    }
}
