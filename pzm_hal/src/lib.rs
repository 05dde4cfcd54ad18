//! PZM Hardware Abstraction Layer
//!
//! Defines the [`BusAdapter`] capability trait consumed by the orchestrator
//! core and the two concrete adapter variants:
//!
//! - [`sim::SimAdapter`] - deterministic in-process drive model for
//!   development, tests, and the demo binary
//! - `native::SoemAdapter` - FFI binding to the soemshim library
//!   (feature `native`)

pub mod adapter;
pub mod sim;

#[cfg(feature = "native")]
pub mod native;

pub use adapter::{BusAdapter, HalError};
pub use sim::{SimAdapter, SimControls};
