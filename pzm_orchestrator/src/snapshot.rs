//! Status snapshots and cycle-time statistics.
//!
//! The loop builds a fresh immutable [`StatusSnapshot`] every tick and
//! swaps it into an `ArcSwap` slot. Readers on any thread load the current
//! `Arc` without taking a lock; they observe either the old or the new
//! snapshot, never a torn one, and the snapshot never aliases the loop's
//! live per-axis arrays.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use pzm_common::frames::TxFrame;
use pzm_common::health::HealthSnapshot;

/// Immutable point-in-time view of the whole bus.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    /// Strictly increasing per published snapshot.
    pub sequence: u64,
    /// Wall-clock time of publication.
    pub timestamp: SystemTime,
    /// Bus health counters from the same tick.
    pub health: HealthSnapshot,
    /// Last input frame of every slave, 0-based by axis index.
    pub drive_states: Vec<TxFrame>,
    /// Duration of the most recent complete cycle.
    pub cycle_time: Duration,
    /// Shortest cycle observed since initialization.
    pub min_cycle: Duration,
    /// Longest cycle observed since initialization.
    pub max_cycle: Duration,
}

impl StatusSnapshot {
    /// Pre-loop snapshot: zeroed frames for `slaves` axes, sequence 0.
    pub(crate) fn empty(slaves: usize) -> Self {
        Self {
            sequence: 0,
            timestamp: SystemTime::now(),
            health: HealthSnapshot::default(),
            drive_states: vec![TxFrame::default(); slaves],
            cycle_time: Duration::ZERO,
            min_cycle: Duration::ZERO,
            max_cycle: Duration::ZERO,
        }
    }
}

/// O(1) per-cycle timing statistics.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CycleStats {
    count: u64,
    last: Duration,
    min: Duration,
    max: Duration,
}

impl CycleStats {
    pub const fn new() -> Self {
        Self {
            count: 0,
            last: Duration::ZERO,
            min: Duration::MAX,
            max: Duration::ZERO,
        }
    }

    /// Record one cycle duration.
    #[inline]
    pub fn record(&mut self, duration: Duration) {
        self.count += 1;
        self.last = duration;
        if duration < self.min {
            self.min = duration;
        }
        if duration > self.max {
            self.max = duration;
        }
    }

    #[inline]
    pub fn count(&self) -> u64 {
        self.count
    }

    #[inline]
    pub fn last(&self) -> Duration {
        self.last
    }

    /// Minimum cycle time, zero before the first recorded cycle.
    #[inline]
    pub fn min(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.min
        }
    }

    #[inline]
    pub fn max(&self) -> Duration {
        self.max
    }
}

/// Atomically swappable snapshot slot.
#[derive(Debug)]
pub(crate) struct SnapshotPublisher {
    slot: ArcSwap<StatusSnapshot>,
}

impl SnapshotPublisher {
    pub fn new(initial: StatusSnapshot) -> Self {
        Self {
            slot: ArcSwap::from_pointee(initial),
        }
    }

    /// Replace the published snapshot by reference swap.
    pub fn publish(&self, snapshot: StatusSnapshot) {
        self.slot.store(Arc::new(snapshot));
    }

    /// Load the current snapshot; lock-free and allocation-free.
    pub fn load(&self) -> Arc<StatusSnapshot> {
        self.slot.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_stats_track_last_min_max() {
        let mut stats = CycleStats::new();
        assert_eq!(stats.min(), Duration::ZERO);
        assert_eq!(stats.max(), Duration::ZERO);

        stats.record(Duration::from_micros(500));
        assert_eq!(stats.count(), 1);
        assert_eq!(stats.last(), Duration::from_micros(500));
        assert_eq!(stats.min(), Duration::from_micros(500));
        assert_eq!(stats.max(), Duration::from_micros(500));

        stats.record(Duration::from_micros(300));
        stats.record(Duration::from_micros(900));
        assert_eq!(stats.last(), Duration::from_micros(900));
        assert_eq!(stats.min(), Duration::from_micros(300));
        assert_eq!(stats.max(), Duration::from_micros(900));
    }

    #[test]
    fn publisher_swaps_whole_snapshots() {
        let publisher = SnapshotPublisher::new(StatusSnapshot::empty(2));
        let first = publisher.load();
        assert_eq!(first.sequence, 0);
        assert_eq!(first.drive_states.len(), 2);

        let mut next = StatusSnapshot::empty(2);
        next.sequence = 1;
        next.drive_states[1].actual_position = 777;
        publisher.publish(next);

        // The old Arc is unaffected; the slot holds the new value.
        assert_eq!(first.drive_states[1].actual_position, 0);
        let current = publisher.load();
        assert_eq!(current.sequence, 1);
        assert_eq!(current.drive_states[1].actual_position, 777);
    }
}
