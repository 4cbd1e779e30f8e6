// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Startup scheduler.
//!
//! In self-managed mode shards start through a FIFO queue and a loading gate:
//! at most `capacity` shards may be between launch and fully loaded at once.
//! The supervisor calls [`StartupScheduler::next_ready`] on every tick and
//! after every loading release.
//!
//! In coordinated mode the queue is unused; the coordinator's ticket
//! releases every shard at once.

use std::collections::{BTreeSet, VecDeque};

use serde::Serialize;

use crate::registry::{ShardRegistry, ShardStatus};

/// How shards get started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupMode {
    /// Local queue and loading gate.
    SelfManaged,
    /// Launch everything once the coordinator grants a ticket.
    Coordinated,
}

/// Start queue plus loading gate.
#[derive(Debug)]
pub struct StartupScheduler {
    mode: StartupMode,
    queue: VecDeque<u32>,
    loading: BTreeSet<u32>,
    capacity: usize,
}

impl StartupScheduler {
    /// Create a scheduler. A capacity of 0 is treated as 1.
    pub fn new(mode: StartupMode, capacity: usize) -> Self {
        Self {
            mode,
            queue: VecDeque::new(),
            loading: BTreeSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Loading gate capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a shard to the queue. Returns `false` if it is already queued.
    pub fn enqueue(&mut self, shard_id: u32) -> bool {
        if self.queue.contains(&shard_id) {
            return false;
        }
        self.queue.push_back(shard_id);
        true
    }

    /// Pop the next shard to launch, if the gate has room.
    ///
    /// Entries whose record is no longer `queued` are discarded. The
    /// returned shard occupies a gate slot until [`release`](Self::release).
    /// Always `None` in coordinated mode.
    pub fn next_ready(&mut self, registry: &ShardRegistry) -> Option<u32> {
        if self.mode == StartupMode::Coordinated || self.loading.len() >= self.capacity {
            return None;
        }
        while let Some(shard_id) = self.queue.pop_front() {
            if registry.status(shard_id).ok() == Some(ShardStatus::Queued) {
                self.loading.insert(shard_id);
                return Some(shard_id);
            }
        }
        None
    }

    /// Free the gate slot held by a shard. Returns `false` if it held none.
    pub fn release(&mut self, shard_id: u32) -> bool {
        self.loading.remove(&shard_id)
    }

    /// Queued shard ids, head first.
    pub fn queued(&self) -> Vec<u32> {
        self.queue.iter().copied().collect()
    }

    /// Queue length.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Occupied gate slots.
    pub fn loading_count(&self) -> usize {
        self.loading.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_queued(count: u32, queued: &[u32]) -> ShardRegistry {
        let mut registry = ShardRegistry::new(count, 9229);
        for id in queued {
            registry.mark_queued(*id).unwrap();
        }
        registry
    }

    #[test]
    fn test_one_at_a_time() {
        let registry = registry_with_queued(3, &[1, 2, 3]);
        let mut scheduler = StartupScheduler::new(StartupMode::SelfManaged, 1);
        for id in [1, 2, 3] {
            assert!(scheduler.enqueue(id));
        }

        assert_eq!(scheduler.next_ready(&registry), Some(1));
        assert_eq!(scheduler.next_ready(&registry), None);
        assert_eq!(scheduler.queue_len(), 2);

        assert!(scheduler.release(1));
        assert_eq!(scheduler.next_ready(&registry), Some(2));
        assert!(scheduler.release(2));
        assert_eq!(scheduler.next_ready(&registry), Some(3));
        assert!(scheduler.release(3));
        assert_eq!(scheduler.next_ready(&registry), None);
    }

    #[test]
    fn test_enqueue_is_deduplicated() {
        let mut scheduler = StartupScheduler::new(StartupMode::SelfManaged, 1);
        assert!(scheduler.enqueue(4));
        assert!(!scheduler.enqueue(4));
        assert_eq!(scheduler.queued(), vec![4]);
    }

    #[test]
    fn test_skips_entries_no_longer_queued() {
        let mut registry = registry_with_queued(3, &[1, 2]);
        let mut scheduler = StartupScheduler::new(StartupMode::SelfManaged, 1);
        scheduler.enqueue(1);
        scheduler.enqueue(2);

        // Shard 1 was started directly by an operator in the meantime
        registry.begin_launch(1).unwrap();

        assert_eq!(scheduler.next_ready(&registry), Some(2));
        assert_eq!(scheduler.queue_len(), 0);
    }

    #[test]
    fn test_wider_gate() {
        let registry = registry_with_queued(3, &[1, 2, 3]);
        let mut scheduler = StartupScheduler::new(StartupMode::SelfManaged, 2);
        for id in [1, 2, 3] {
            scheduler.enqueue(id);
        }

        assert_eq!(scheduler.next_ready(&registry), Some(1));
        assert_eq!(scheduler.next_ready(&registry), Some(2));
        assert_eq!(scheduler.next_ready(&registry), None);
        assert_eq!(scheduler.loading_count(), 2);
    }

    #[test]
    fn test_zero_capacity_means_one() {
        let scheduler = StartupScheduler::new(StartupMode::SelfManaged, 0);
        assert_eq!(scheduler.capacity(), 1);
    }

    #[test]
    fn test_release_unknown() {
        let mut scheduler = StartupScheduler::new(StartupMode::SelfManaged, 1);
        assert!(!scheduler.release(7));
    }

    #[test]
    fn test_coordinated_never_dequeues() {
        let registry = registry_with_queued(1, &[1]);
        let mut scheduler = StartupScheduler::new(StartupMode::Coordinated, 1);
        scheduler.enqueue(1);
        assert_eq!(scheduler.next_ready(&registry), None);
        assert_eq!(scheduler.loading_count(), 0);
    }
}
