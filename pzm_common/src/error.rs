//! Error taxonomy surfaced to orchestrator callers.

use thiserror::Error;

use crate::fault::{DriveErrorCode, DriveFault};

/// Error type for all public orchestrator operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OrchestratorError {
    /// An operation was invoked before `initialize`.
    #[error("orchestrator is not initialized")]
    NotInitialized,

    /// `initialize` was invoked a second time.
    #[error("orchestrator is already initialized")]
    AlreadyInitialized,

    /// The bus adapter could not be opened.
    #[error("failed to open bus adapter: {0}")]
    AdapterOpenFailed(String),

    /// The bus came up with zero slaves.
    #[error("no slaves found on the bus")]
    NoSlaves,

    /// Argument validation failed before dispatch.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The slave number is outside the discovered bus topology.
    #[error("slave {slave} out of range (bus has {count} slaves)")]
    SlaveOutOfRange { slave: u16, count: usize },

    /// The axis already has an active command.
    #[error("slave {slave} already has a command in flight")]
    AlreadyInFlight { slave: u16 },

    /// The axis status does not satisfy the operation's preconditions.
    #[error("slave {slave} not ready: {missing}")]
    NotReady { slave: u16, missing: String },

    /// The axis is stop-latched; motion requires RSET or ENBL=1 first.
    #[error("slave {slave} is stop-latched")]
    Latched { slave: u16 },

    /// The caller cancelled the operation.
    #[error("command cancelled by caller")]
    Cancelled,

    /// The orchestrator was shut down while the command was in flight.
    #[error("session ended while the command was in flight")]
    SessionEnded,

    /// The bus session was reinitialized while the command was in flight.
    #[error("session restarted while the command was in flight")]
    SessionRestarted,

    /// A drive-side failure; `hint` carries the recovery advice.
    #[error("drive fault {code:?}: {message} ({hint})")]
    Drive {
        code: DriveErrorCode,
        message: String,
        hint: String,
    },
}

impl OrchestratorError {
    /// Wrap a classified drive fault.
    pub fn from_fault(fault: DriveFault) -> Self {
        Self::Drive {
            code: fault.code,
            message: fault.message.to_string(),
            hint: fault.hint.to_string(),
        }
    }

    /// The drive fault code carried by this error, if any.
    pub fn drive_code(&self) -> Option<DriveErrorCode> {
        match self {
            Self::Drive { code, .. } => Some(*code),
            _ => None,
        }
    }
}
