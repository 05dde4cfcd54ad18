//! Status-change and fault event streams.
//!
//! Both streams are fire-and-forget from the loop thread. Subscribers are
//! treated as untrusted slow consumers: each receiver sits behind a bounded
//! broadcast ring, and a subscriber that falls behind loses the oldest
//! events rather than ever blocking the loop.

use std::time::SystemTime;

use pzm_common::fault::DriveFault;
use pzm_common::frames::{CommandKeyword, DriveStatus, TxFrame};
use pzm_common::health::HealthSnapshot;
use tokio::sync::broadcast;

/// Events buffered per subscriber before drop-oldest kicks in.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Emitted once per tick per slave whose input frame changed while a
/// command was active on that axis.
#[derive(Debug, Clone)]
pub struct DriveStatusChangeEvent {
    /// 1-based slave number.
    pub slave: u16,
    /// Wall-clock time of the emitting tick.
    pub timestamp: SystemTime,
    /// Nanoseconds since the I/O loop started, monotonic clock.
    pub monotonic_ticks: u64,
    /// Strictly increasing across all slaves.
    pub sequence: u64,
    /// This tick's input frame.
    pub current: TxFrame,
    /// The previous tick's input frame.
    pub previous: TxFrame,
    /// XOR of current and previous status bits.
    pub changed_bits_mask: u32,
    /// Keyword of the command active on the axis.
    pub active_command_keyword: CommandKeyword,
}

/// Emitted when a classified drive fault passes the per-axis throttle.
#[derive(Debug, Clone)]
pub struct SoemFaultEvent {
    /// 1-based slave number.
    pub slave: u16,
    /// Status vector the fault was decoded from.
    pub status_bits: DriveStatus,
    /// The decoded fault with its recovery hint.
    pub error: DriveFault,
    /// Bus health at the time of the fault.
    pub health: HealthSnapshot,
}

/// The two fan-out channels, held by the shared session state.
#[derive(Debug)]
pub(crate) struct EventBus {
    status_tx: broadcast::Sender<DriveStatusChangeEvent>,
    fault_tx: broadcast::Sender<SoemFaultEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (status_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (fault_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            status_tx,
            fault_tx,
        }
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<DriveStatusChangeEvent> {
        self.status_tx.subscribe()
    }

    pub fn subscribe_faults(&self) -> broadcast::Receiver<SoemFaultEvent> {
        self.fault_tx.subscribe()
    }

    /// Publish without ever blocking; no subscribers is not an error.
    pub fn publish_status(&self, event: DriveStatusChangeEvent) {
        let _ = self.status_tx.send(event);
    }

    pub fn publish_fault(&self, event: SoemFaultEvent) {
        let _ = self.fault_tx.send(event);
    }
}
