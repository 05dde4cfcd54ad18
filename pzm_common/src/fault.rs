//! Drive fault codes and the status-vector classifier.
//!
//! `classify` is a pure function from a status flag vector to the highest
//! priority fault it encodes. Priority reflects operator-visible urgency:
//! thermal conditions first, then encoder and follow errors, then the
//! stop-class conditions, and finally end-stop contact.

use serde::Serialize;

use crate::frames::DriveStatus;

/// Closed set of drive fault codes surfaced to callers and event subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DriveErrorCode {
    /// No fault decoded.
    None,
    /// Following error limit exceeded.
    FollowError,
    /// Position settling failed.
    PositionFail,
    /// Drive-side safety timeout elapsed.
    SafetyTimeout,
    /// Emergency stop input active.
    EmergencyStop,
    /// Encoder signal error.
    EncoderError,
    /// Thermal protection active.
    ThermalProtection,
    /// Mechanical end stop reached.
    EndStopHit,
    /// Force-zero condition active.
    ForceZero,
    /// Error compensation fault.
    ErrorCompensationFault,
    /// Condition not attributable to a specific drive fault.
    UnknownFault,
}

/// A decoded drive fault: code, operator message, and recovery hint.
///
/// The hint travels with the error surfaced to the caller so that a failed
/// public call carries the drive-side recovery advice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DriveFault {
    pub code: DriveErrorCode,
    pub message: &'static str,
    pub hint: &'static str,
}

const FAULT_TABLE: &[(DriveStatus, DriveFault)] = &[
    (
        DriveStatus::THERMAL_PROTECTION_1,
        DriveFault {
            code: DriveErrorCode::ThermalProtection,
            message: "thermal protection 1 active",
            hint: "let the drive cool down, then ENBL=1 or RSET",
        },
    ),
    (
        DriveStatus::THERMAL_PROTECTION_2,
        DriveFault {
            code: DriveErrorCode::ThermalProtection,
            message: "thermal protection 2 active",
            hint: "let the drive cool down, then ENBL=1 or RSET",
        },
    ),
    (
        DriveStatus::ENCODER_ERROR,
        DriveFault {
            code: DriveErrorCode::EncoderError,
            message: "encoder error",
            hint: "check the encoder signal; RSET then INDX",
        },
    ),
    (
        DriveStatus::ERROR_LIMIT,
        DriveFault {
            code: DriveErrorCode::FollowError,
            message: "following error limit exceeded",
            hint: "reduce speed or acceleration; ENBL=1",
        },
    ),
    (
        DriveStatus::SAFETY_TIMEOUT,
        DriveFault {
            code: DriveErrorCode::SafetyTimeout,
            message: "drive safety timeout",
            hint: "RSET or ENBL=1; adjust TOU2",
        },
    ),
    (
        DriveStatus::EMERGENCY_STOP,
        DriveFault {
            code: DriveErrorCode::EmergencyStop,
            message: "emergency stop active",
            hint: "clear the emergency stop, then ENBL=1 or RSET",
        },
    ),
    (
        DriveStatus::POSITION_FAIL,
        DriveFault {
            code: DriveErrorCode::PositionFail,
            message: "position settling failed",
            hint: "relax PTOL/PTO2/TOU3; ENBL=1 or RSET",
        },
    ),
];

/// Classify a status vector into the highest-priority fault, if any.
pub fn classify(status: DriveStatus) -> Option<DriveFault> {
    for (trigger, fault) in FAULT_TABLE {
        if status.contains(*trigger) {
            return Some(*fault);
        }
    }
    // End-stop contact requires the general end-stop flag plus a side.
    if status.contains(DriveStatus::END_STOP | DriveStatus::LEFT_END_STOP) {
        return Some(DriveFault {
            code: DriveErrorCode::EndStopHit,
            message: "left end stop hit",
            hint: "jog away from the left end stop",
        });
    }
    if status.contains(DriveStatus::END_STOP | DriveStatus::RIGHT_END_STOP) {
        return Some(DriveFault {
            code: DriveErrorCode::EndStopHit,
            message: "right end stop hit",
            hint: "jog away from the right end stop",
        });
    }
    None
}
