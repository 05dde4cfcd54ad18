//! Working-counter strike ladder.
//!
//! Tracks two counters across cycles: `wkc_strikes` for degraded exchanges
//! and `fatal_errors` for send/receive/argument failures. Degraded cycles
//! escalate to the adapter's in-place recovery after a configurable number
//! of strikes; repeated fatal errors force a full session reinitialization.

use pzm_common::health::WireOutcome;

/// Fatal errors tolerated before a forced reinitialization.
const FATAL_REINIT_THRESHOLD: u32 = 3;

/// Escalation decided for this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LadderAction {
    /// Keep going.
    None,
    /// Call the adapter's recovery primitive.
    Recover,
    /// Tear the session down and bring it back up.
    Reinitialize,
}

#[derive(Debug)]
pub(crate) struct RecoveryLadder {
    wkc_strikes: u32,
    fatal_errors: u32,
    strike_threshold: u32,
}

impl RecoveryLadder {
    pub fn new(strike_threshold: u32) -> Self {
        Self {
            wkc_strikes: 0,
            fatal_errors: 0,
            strike_threshold,
        }
    }

    /// Feed one cycle's wire outcome and get the escalation decision.
    pub fn observe(&mut self, outcome: WireOutcome) -> LadderAction {
        match outcome {
            WireOutcome::Healthy => {
                self.wkc_strikes = 0;
                self.fatal_errors = 0;
                LadderAction::None
            }
            WireOutcome::WkcLow | WireOutcome::Unknown => {
                self.fatal_errors = 0;
                self.strike()
            }
            WireOutcome::Fatal => {
                self.fatal_errors += 1;
                if self.fatal_errors >= FATAL_REINIT_THRESHOLD {
                    LadderAction::Reinitialize
                } else {
                    self.strike()
                }
            }
        }
    }

    fn strike(&mut self) -> LadderAction {
        self.wkc_strikes += 1;
        if self.wkc_strikes >= self.strike_threshold {
            LadderAction::Recover
        } else {
            LadderAction::None
        }
    }

    /// A recovery attempt ran (either outcome): the strike count restarts.
    pub fn recovery_attempted(&mut self) {
        self.wkc_strikes = 0;
    }

    /// A reinitialization ran: both counters restart.
    pub fn reset(&mut self) {
        self.wkc_strikes = 0;
        self.fatal_errors = 0;
    }

    #[cfg(test)]
    pub fn wkc_strikes(&self) -> u32 {
        self.wkc_strikes
    }

    #[cfg(test)]
    pub fn fatal_errors(&self) -> u32 {
        self.fatal_errors
    }
}
