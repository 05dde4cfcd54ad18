//! Per-axis state owned by the I/O loop.

use std::time::{Duration, Instant};

use pzm_common::fault::DriveErrorCode;
use pzm_common::frames::{RxFrame, TxFrame};

use crate::command::PendingCommand;

/// Duplicate-fault suppression for one axis.
///
/// A fault with the same code as the last published one is suppressed
/// within the repeat interval. A different code publishes immediately, and
/// a clean decode resets the pair so any future fault publishes at once.
#[derive(Debug, Default)]
pub(crate) struct FaultThrottle {
    last_code: Option<DriveErrorCode>,
    last_time: Option<Instant>,
}

impl FaultThrottle {
    /// Decide whether to publish this fault now; records it if admitted.
    pub fn admit(&mut self, code: DriveErrorCode, now: Instant, interval: Duration) -> bool {
        if self.last_code == Some(code) {
            if let Some(last) = self.last_time {
                if now.duration_since(last) < interval {
                    return false;
                }
            }
        }
        self.last_code = Some(code);
        self.last_time = Some(now);
        true
    }

    /// Clean decode observed: forget the last fault.
    pub fn reset(&mut self) {
        self.last_code = None;
        self.last_time = None;
    }
}

/// Per-slave row of the axis state table.
///
/// The output frame scratch, the input frame history, and the active
/// command slot are touched exclusively by the loop thread.
#[derive(Debug)]
pub(crate) struct AxisState {
    /// Output frame staged every cycle.
    pub rx: RxFrame,
    /// Most recent input frame.
    pub tx: TxFrame,
    /// Input frame from the previous cycle.
    pub prev_tx: TxFrame,
    /// The single active command, if any.
    pub active: Option<PendingCommand>,
    /// Duplicate-fault suppression state.
    pub throttle: FaultThrottle,
}

impl AxisState {
    pub fn new() -> Self {
        Self {
            rx: RxFrame::nop(),
            tx: TxFrame::default(),
            prev_tx: TxFrame::default(),
            active: None,
            throttle: FaultThrottle::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(5);

    #[test]
    fn repeated_code_is_suppressed_within_interval() {
        let mut throttle = FaultThrottle::default();
        let t0 = Instant::now();
        assert!(throttle.admit(DriveErrorCode::FollowError, t0, INTERVAL));
        assert!(!throttle.admit(DriveErrorCode::FollowError, t0 + Duration::from_secs(1), INTERVAL));
        assert!(!throttle.admit(DriveErrorCode::FollowError, t0 + Duration::from_secs(4), INTERVAL));
        assert!(throttle.admit(DriveErrorCode::FollowError, t0 + INTERVAL, INTERVAL));
    }

    #[test]
    fn different_code_publishes_immediately() {
        let mut throttle = FaultThrottle::default();
        let t0 = Instant::now();
        assert!(throttle.admit(DriveErrorCode::FollowError, t0, INTERVAL));
        assert!(throttle.admit(DriveErrorCode::EncoderError, t0 + Duration::from_millis(1), INTERVAL));
        // And switching back also publishes: the stored code changed.
        assert!(throttle.admit(DriveErrorCode::FollowError, t0 + Duration::from_millis(2), INTERVAL));
    }

    #[test]
    fn clean_decode_resets_suppression() {
        let mut throttle = FaultThrottle::default();
        let t0 = Instant::now();
        assert!(throttle.admit(DriveErrorCode::ThermalProtection, t0, INTERVAL));
        assert!(!throttle.admit(DriveErrorCode::ThermalProtection, t0 + Duration::from_secs(1), INTERVAL));

        throttle.reset();
        assert!(throttle.admit(DriveErrorCode::ThermalProtection, t0 + Duration::from_secs(2), INTERVAL));
    }

    #[test]
    fn new_axis_stages_an_idle_frame() {
        let axis = AxisState::new();
        assert_eq!(axis.rx, RxFrame::nop());
        assert_eq!(axis.rx.execute, 0);
        assert!(axis.active.is_none());
        assert_eq!(axis.tx, TxFrame::default());
    }
}
