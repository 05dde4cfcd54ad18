//! Bus health counters and wire-level error classification.

use serde::Serialize;

/// Fatal argument error from the adapter (null handle, bad slave index).
pub const ERR_BAD_ARGS: i32 = -13;
/// Process-data receive failed.
pub const ERR_RECV_FAIL: i32 = -12;
/// Process-data send failed.
pub const ERR_SEND_FAIL: i32 = -11;
/// Exchange completed but the working counter came back low.
pub const ERR_WKC_LOW: i32 = -10;

/// Health counters reported by the adapter after each exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    /// Slaves found during bus configuration.
    pub slaves_found: i32,
    /// Expected working counter for the process-data group.
    pub group_expected_wkc: i32,
    /// Working counter returned by the most recent exchange.
    pub last_wkc: i32,
    /// Output process image size in bytes.
    pub bytes_out: i32,
    /// Input process image size in bytes.
    pub bytes_in: i32,
    /// Slaves currently in the operational state.
    pub slaves_operational: i32,
    /// Application-layer status code of the first faulted slave, 0 if none.
    pub al_status_code: u32,
}

/// Outcome of one bus exchange, as seen by the recovery ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireOutcome {
    /// Exchange succeeded and the working counter matched expectations.
    Healthy,
    /// One or more slaves did not service the frame.
    WkcLow,
    /// Send/receive/argument failure; escalates fast.
    Fatal,
    /// Unrecognized negative return; treated like a degraded cycle.
    Unknown,
}

/// Classify an exchange return value against the current health counters.
///
/// Healthy requires the working counter to match expectations exactly; a
/// counter above the expected value is just as suspect as one below it.
pub fn classify_exchange(wkc: i32, health: &HealthSnapshot) -> WireOutcome {
    match wkc {
        w if w >= 0 && health.last_wkc == health.group_expected_wkc => WireOutcome::Healthy,
        w if w >= 0 => WireOutcome::WkcLow,
        ERR_WKC_LOW => WireOutcome::WkcLow,
        ERR_SEND_FAIL | ERR_RECV_FAIL | ERR_BAD_ARGS => WireOutcome::Fatal,
        _ => WireOutcome::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn health(expected: i32, last: i32) -> HealthSnapshot {
        HealthSnapshot {
            group_expected_wkc: expected,
            last_wkc: last,
            ..HealthSnapshot::default()
        }
    }

    #[test]
    fn matching_wkc_is_healthy() {
        assert_eq!(classify_exchange(9, &health(9, 9)), WireOutcome::Healthy);
        // A zero-slave group with zero expected counter still counts.
        assert_eq!(classify_exchange(0, &health(0, 0)), WireOutcome::Healthy);
    }

    #[test]
    fn low_wkc_is_degraded() {
        assert_eq!(classify_exchange(8, &health(9, 8)), WireOutcome::WkcLow);
        assert_eq!(classify_exchange(ERR_WKC_LOW, &health(9, 8)), WireOutcome::WkcLow);
    }

    #[test]
    fn high_wkc_is_degraded_too() {
        // A counter above the expected value means the health read (or the
        // driver) is lying; never treat that as healthy.
        assert_eq!(classify_exchange(10, &health(9, 10)), WireOutcome::WkcLow);
    }

    #[test]
    fn send_recv_and_bad_args_are_fatal() {
        let h = health(9, 9);
        assert_eq!(classify_exchange(ERR_SEND_FAIL, &h), WireOutcome::Fatal);
        assert_eq!(classify_exchange(ERR_RECV_FAIL, &h), WireOutcome::Fatal);
        assert_eq!(classify_exchange(ERR_BAD_ARGS, &h), WireOutcome::Fatal);
    }

    #[test]
    fn other_negative_values_are_unknown() {
        assert_eq!(classify_exchange(-1, &health(9, 9)), WireOutcome::Unknown);
        assert_eq!(classify_exchange(-99, &health(9, 9)), WireOutcome::Unknown);
    }
}
