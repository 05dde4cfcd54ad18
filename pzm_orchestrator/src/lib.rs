//! # PZM Drive Orchestrator
//!
//! High-level orchestrator for a fieldbus network of piezo-motion drives.
//! A single dedicated worker runs a strictly periodic I/O loop that
//! exchanges cyclic process data with every drive, while asynchronous
//! callers funnel motion requests through a command ingest channel and
//! await per-command completion promises.
//!
//! ## Architecture
//!
//! 1. **I/O loop** - ingest, stage, exchange, health, classify, evaluate,
//!    publish, every cycle period
//! 2. **Pending commands** - one in-flight request per axis, completed
//!    against status bits and position edges
//! 3. **Recovery ladder** - working-counter strikes, in-place recovery,
//!    full session reinitialization
//! 4. **Snapshots and events** ([`snapshot`], [`events`]) - lock-free
//!    status snapshots plus fire-and-forget change and fault streams
//!
//! The loop owns the bus adapter and all per-axis frame state; callers
//! only ever touch the ingest channel, the snapshot slot, the per-axis
//! gates, and the event streams.

pub mod events;
pub mod orchestrator;
pub mod snapshot;

mod axis;
mod command;
mod cycle;
mod recovery;

pub use events::{DriveStatusChangeEvent, SoemFaultEvent};
pub use orchestrator::DriveOrchestrator;
pub use snapshot::StatusSnapshot;
