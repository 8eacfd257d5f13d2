//! Per-client snapshot history

use crate::snapshot::Snapshot;
use std::collections::VecDeque;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct SnapshotHolder {
    pub tick: i32,
    /// When the snapshot was produced; used to measure client latency on ack
    pub tagtime: Instant,
    pub snap: Snapshot,
}

/// Snapshots ordered by tick, oldest first
#[derive(Debug, Default)]
pub struct SnapshotStorage {
    holders: VecDeque<SnapshotHolder>,
}

impl SnapshotStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, tick: i32, tagtime: Instant, snap: Snapshot) {
        self.holders.push_back(SnapshotHolder { tick, tagtime, snap });
    }

    pub fn get(&self, tick: i32) -> Option<&SnapshotHolder> {
        self.holders.iter().find(|holder| holder.tick == tick)
    }

    /// Drops every snapshot with a tick lower than `tick`
    pub fn purge_until(&mut self, tick: i32) {
        while self
            .holders
            .front()
            .is_some_and(|holder| holder.tick < tick)
        {
            self.holders.pop_front();
        }
    }

    pub fn purge_all(&mut self) {
        self.holders.clear();
    }

    pub fn oldest_tick(&self) -> Option<i32> {
        self.holders.front().map(|holder| holder.tick)
    }

    pub fn len(&self) -> usize {
        self.holders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.holders.is_empty()
    }
}
