//! Orchestrator options record.
//!
//! A single flat options struct with serde defaults, parseable from TOML.
//! Discovery and file handling belong to the embedding application; only
//! parsing and validation live here.
//!
//! # TOML Example
//!
//! ```toml
//! cycle_period_us = 2000
//! wkc_recovery_threshold = 3
//! enable_cycle_trace_logging = false
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Error type for options parsing and validation.
#[derive(Debug, Clone, Error)]
pub enum OptionsError {
    /// TOML parsing failed.
    #[error("failed to parse options: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("options validation failed: {0}")]
    ValidationError(String),
}

/// Tunable parameters of the drive orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrchestratorOptions {
    /// I/O loop cycle period [µs].
    #[serde(default = "default_cycle_period_us")]
    pub cycle_period_us: u32,

    /// Process-data exchange timeout [µs].
    #[serde(default = "default_exchange_timeout_us")]
    pub exchange_timeout_us: u32,

    /// Consecutive degraded cycles before in-place recovery is attempted.
    #[serde(default = "default_wkc_recovery_threshold")]
    pub wkc_recovery_threshold: u32,

    /// Timeout handed to the adapter's recovery primitive [ms].
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u32,

    /// Delay between adapter shutdown and re-open during reinitialization [ms].
    #[serde(default = "default_reinitialization_delay_ms")]
    pub reinitialization_delay_ms: u64,

    /// Settle timeout applied to motion commands when the caller gives none [ms].
    #[serde(default = "default_settle_timeout_ms")]
    pub default_settle_timeout_ms: u64,

    /// Emit a trace event per cycle (high volume).
    #[serde(default)]
    pub enable_cycle_trace_logging: bool,

    /// Minimum interval between repeated fault reports per slave and code [ms].
    #[serde(default = "default_fault_repeat_interval_ms")]
    pub fault_repeat_interval_ms: u64,
}

fn default_cycle_period_us() -> u32 {
    2_000
}

fn default_exchange_timeout_us() -> u32 {
    100_000
}

fn default_wkc_recovery_threshold() -> u32 {
    3
}

fn default_recovery_timeout_ms() -> u32 {
    500
}

fn default_reinitialization_delay_ms() -> u64 {
    200
}

fn default_settle_timeout_ms() -> u64 {
    10_000
}

fn default_fault_repeat_interval_ms() -> u64 {
    5_000
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            cycle_period_us: default_cycle_period_us(),
            exchange_timeout_us: default_exchange_timeout_us(),
            wkc_recovery_threshold: default_wkc_recovery_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            reinitialization_delay_ms: default_reinitialization_delay_ms(),
            default_settle_timeout_ms: default_settle_timeout_ms(),
            enable_cycle_trace_logging: false,
            fault_repeat_interval_ms: default_fault_repeat_interval_ms(),
        }
    }
}

impl OrchestratorOptions {
    /// Parse options from a TOML string and validate them.
    pub fn from_toml_str(s: &str) -> Result<Self, OptionsError> {
        let options: Self =
            toml::from_str(s).map_err(|e| OptionsError::ParseError(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Validate semantic constraints.
    ///
    /// # Errors
    ///
    /// Returns `OptionsError::ValidationError` if the cycle period,
    /// exchange timeout, or recovery threshold is zero.
    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.cycle_period_us == 0 {
            return Err(OptionsError::ValidationError(
                "cycle_period_us must be non-zero".to_string(),
            ));
        }
        if self.exchange_timeout_us == 0 {
            return Err(OptionsError::ValidationError(
                "exchange_timeout_us must be non-zero".to_string(),
            ));
        }
        if self.wkc_recovery_threshold == 0 {
            return Err(OptionsError::ValidationError(
                "wkc_recovery_threshold must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Cycle period as a [`Duration`].
    #[inline]
    pub fn cycle_period(&self) -> Duration {
        Duration::from_micros(u64::from(self.cycle_period_us))
    }

    /// Reinitialization delay as a [`Duration`].
    #[inline]
    pub fn reinitialization_delay(&self) -> Duration {
        Duration::from_millis(self.reinitialization_delay_ms)
    }

    /// Default settle timeout as a [`Duration`].
    #[inline]
    pub fn default_settle_timeout(&self) -> Duration {
        Duration::from_millis(self.default_settle_timeout_ms)
    }

    /// Fault repeat interval as a [`Duration`].
    #[inline]
    pub fn fault_repeat_interval(&self) -> Duration {
        Duration::from_millis(self.fault_repeat_interval_ms)
    }
}
