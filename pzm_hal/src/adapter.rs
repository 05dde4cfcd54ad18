//! Bus adapter capability trait.
//!
//! The orchestrator core depends on exactly this surface; it never sees the
//! wire protocol, raw sockets, or distributed-clock handling behind it.

use pzm_common::frames::{RxFrame, TxFrame};
use pzm_common::health::HealthSnapshot;
use thiserror::Error;

/// Error types for adapter operations.
#[derive(Debug, Clone, Error)]
pub enum HalError {
    /// Adapter initialization failed.
    #[error("initialization failed: {0}")]
    InitFailed(String),

    /// Operation attempted on a closed adapter.
    #[error("adapter is not open")]
    NotOpen,

    /// Slave number outside the discovered topology.
    #[error("invalid slave {slave} (bus has {count} slaves)")]
    InvalidSlave { slave: u16, count: usize },

    /// Bus communication error.
    #[error("bus communication error: {0}")]
    CommunicationError(String),
}

/// Capability surface of a fieldbus adapter.
///
/// Slave numbers are 1-based, matching the bus addressing convention.
///
/// # Lifecycle
///
/// 1. `open()` - configure the bus and bring slaves operational
/// 2. `write_rx` / `exchange` / `read_tx` / `health` - once per cycle
/// 3. `recover()` - on working-counter degradation
/// 4. `close()` - release the bus; `open()` may be called again
///
/// # Timing Contracts
///
/// | Operation | Expected Duration |
/// |-----------|-------------------|
/// | `open()` | up to seconds (pre-loop) |
/// | `exchange()` | bounded by its timeout argument |
/// | all other cyclic calls | microseconds |
///
/// Implementations are owned and driven by a single loop thread; they are
/// `Send` but need not be `Sync`.
pub trait BusAdapter: Send {
    /// Open the bus on the given network interface.
    fn open(&mut self, interface: &str) -> Result<(), HalError>;

    /// Release the bus. A closed adapter may be re-opened.
    fn close(&mut self);

    /// Whether the adapter currently holds an open bus session.
    fn is_open(&self) -> bool;

    /// Number of slaves found during the last `open()`.
    fn slave_count(&self) -> usize;

    /// Stage the output frame for one slave.
    fn write_rx(&mut self, slave: u16, frame: &RxFrame) -> Result<(), HalError>;

    /// Read the most recent input frame of one slave.
    fn read_tx(&mut self, slave: u16) -> Result<TxFrame, HalError>;

    /// Run one process-data exchange.
    ///
    /// Returns the working counter on success or one of the negative wire
    /// error codes in [`pzm_common::health`].
    fn exchange(&mut self, timeout_us: u32) -> i32;

    /// Current health counters.
    fn health(&mut self) -> HealthSnapshot;

    /// Attempt in-place recovery of non-operational slaves.
    ///
    /// Returns a positive value when the whole group is back operational.
    fn recover(&mut self, timeout_ms: u32) -> i32;

    /// Drain the adapter's error sink. Empty string means no errors.
    fn drain_errors(&mut self) -> String;
}
