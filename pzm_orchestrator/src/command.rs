//! Pending command entity and its completion state machine.
//!
//! A `PendingCommand` is created by a public operation, travels through the
//! ingest channel, becomes the axis's single active command, and is mutated
//! only by the I/O loop until it completes, fails, times out, or is
//! cancelled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use pzm_common::error::OrchestratorError;
use pzm_common::frames::{CommandKeyword, DriveStatus, TxFrame};
use tokio::sync::oneshot;

/// How a command is judged complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompletionCriterion {
    /// Complete once the drive acks the execute request.
    AckOnly,
    /// Complete once acked AND the given duration has elapsed since start.
    /// Times out if the duration elapses without an ack.
    AckWithTimeout(Duration),
    /// Complete on a PositionReached rising edge, a MotorOn falling edge,
    /// or (for `DPOS`) an exact position match. Edge scratch is seeded on
    /// the first evaluation so a drive already at rest must produce a
    /// fresh edge.
    PositionReached,
    /// Complete when EncoderValid and PositionReached are both set.
    Indexed,
    /// Complete when AmplifiersEnabled and MotorOn are both set.
    Enabled,
    /// Complete when AmplifiersEnabled is clear.
    Disabled,
    /// Complete when Scanning is clear.
    Halt,
}

/// Stop-latch side effect applied when the command completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LatchEffect {
    None,
    /// `STOP` latches the axis against further motion.
    Set,
    /// `RSET` and `ENBL 1` release the latch.
    Clear,
}

/// Evaluation result for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Pending,
    Complete,
    TimedOut,
}

/// Edge-detection scratch for the PositionReached criterion.
#[derive(Debug, Clone, Copy, Default)]
struct EdgeScratch {
    seeded: bool,
    prev_position_reached: bool,
    prev_motor_on: bool,
}

/// Everything a public operation decides about a command.
#[derive(Debug, Clone)]
pub(crate) struct CommandSpec {
    /// 1-based slave number.
    pub slave: u16,
    pub keyword: CommandKeyword,
    pub parameter: i32,
    pub velocity: i32,
    pub acceleration: u16,
    pub deceleration: u16,
    pub requires_ack: bool,
    pub criterion: CompletionCriterion,
    /// Zero means no timeout.
    pub timeout: Duration,
    pub latch: LatchEffect,
}

/// One in-flight request, owned by the I/O loop once installed.
pub(crate) struct PendingCommand {
    pub spec: CommandSpec,
    pub acked: bool,
    started_at: Option<Instant>,
    edge: EdgeScratch,
    cancelled: Arc<AtomicBool>,
    done: Option<oneshot::Sender<Result<(), OrchestratorError>>>,
}

impl PendingCommand {
    /// Build a command and the receiver half of its completion promise.
    pub fn new(spec: CommandSpec) -> (Self, oneshot::Receiver<Result<(), OrchestratorError>>) {
        let (done, receiver) = oneshot::channel();
        (
            Self {
                spec,
                acked: false,
                started_at: None,
                edge: EdgeScratch::default(),
                cancelled: Arc::new(AtomicBool::new(false)),
                done: Some(done),
            },
            receiver,
        )
    }

    /// Handle the caller keeps to signal cancellation.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Called by the loop when the command is installed in its slot.
    pub fn start(&mut self, now: Instant) {
        self.acked = false;
        self.started_at = Some(now);
        self.edge = EdgeScratch::default();
    }

    /// Resolve the completion promise. The receiver may already be gone
    /// (cancelled caller); that is fine.
    pub fn resolve(mut self, result: Result<(), OrchestratorError>) {
        if let Some(done) = self.done.take() {
            let _ = done.send(result);
        }
    }

    fn elapsed(&self, now: Instant) -> Duration {
        self.started_at
            .map(|t| now.duration_since(t))
            .unwrap_or(Duration::ZERO)
    }

    fn check_timeout(&self, now: Instant) -> Verdict {
        if !self.spec.timeout.is_zero() && self.elapsed(now) >= self.spec.timeout {
            Verdict::TimedOut
        } else {
            Verdict::Pending
        }
    }

    /// Evaluate the command against this tick's input frame.
    ///
    /// Latches the ack bit first; once acked, the loop drives the execute
    /// request low on subsequent cycles for ack-requiring commands.
    pub fn evaluate(&mut self, tx: &TxFrame, now: Instant) -> Verdict {
        let status = tx.status;
        if !self.acked && status.contains(DriveStatus::EXECUTE_ACK) {
            self.acked = true;
        }

        match self.spec.criterion {
            CompletionCriterion::AckOnly => {
                if self.acked {
                    Verdict::Complete
                } else {
                    self.check_timeout(now)
                }
            }
            CompletionCriterion::AckWithTimeout(hold) => {
                // Both conditions must hold: acked AND the hold time spent.
                if self.elapsed(now) >= hold {
                    if self.acked {
                        Verdict::Complete
                    } else {
                        Verdict::TimedOut
                    }
                } else {
                    Verdict::Pending
                }
            }
            CompletionCriterion::PositionReached => {
                let position_reached = status.contains(DriveStatus::POSITION_REACHED);
                let motor_on = status.contains(DriveStatus::MOTOR_ON);
                if !self.edge.seeded {
                    self.edge = EdgeScratch {
                        seeded: true,
                        prev_position_reached: position_reached,
                        prev_motor_on: motor_on,
                    };
                    return Verdict::Pending;
                }
                let rising_edge = position_reached && !self.edge.prev_position_reached;
                let motor_dropped = !motor_on && self.edge.prev_motor_on;
                let at_target = self.spec.keyword == CommandKeyword::DPOS
                    && tx.actual_position == self.spec.parameter;
                self.edge.prev_position_reached = position_reached;
                self.edge.prev_motor_on = motor_on;
                if rising_edge || motor_dropped || at_target {
                    Verdict::Complete
                } else {
                    self.check_timeout(now)
                }
            }
            CompletionCriterion::Indexed => {
                if status.contains(DriveStatus::ENCODER_VALID | DriveStatus::POSITION_REACHED) {
                    Verdict::Complete
                } else {
                    self.check_timeout(now)
                }
            }
            CompletionCriterion::Enabled => {
                if status.contains(DriveStatus::AMPLIFIERS_ENABLED | DriveStatus::MOTOR_ON) {
                    Verdict::Complete
                } else {
                    self.check_timeout(now)
                }
            }
            CompletionCriterion::Disabled => {
                if !status.contains(DriveStatus::AMPLIFIERS_ENABLED) {
                    Verdict::Complete
                } else {
                    self.check_timeout(now)
                }
            }
            CompletionCriterion::Halt => {
                if !status.contains(DriveStatus::SCANNING) {
                    Verdict::Complete
                } else {
                    self.check_timeout(now)
                }
            }
        }
    }
}

impl std::fmt::Debug for PendingCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCommand")
            .field("slave", &self.spec.slave)
            .field("keyword", &self.spec.keyword)
            .field("acked", &self.acked)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(keyword: CommandKeyword, criterion: CompletionCriterion, timeout: Duration) -> CommandSpec {
        CommandSpec {
            slave: 1,
            keyword,
            parameter: 0,
            velocity: 0,
            acceleration: 0,
            deceleration: 0,
            requires_ack: true,
            criterion,
            timeout,
            latch: LatchEffect::None,
        }
    }

    fn command(criterion: CompletionCriterion, timeout: Duration) -> (PendingCommand, Instant) {
        let (mut cmd, _rx) = PendingCommand::new(spec(CommandKeyword::STOP, criterion, timeout));
        let start = Instant::now();
        cmd.start(start);
        (cmd, start)
    }

    fn frame(status: DriveStatus) -> TxFrame {
        TxFrame {
            actual_position: 0,
            status,
            slot: 1,
        }
    }

    #[test]
    fn ack_only_completes_on_ack() {
        let (mut cmd, start) = command(CompletionCriterion::AckOnly, Duration::from_secs(2));
        assert_eq!(cmd.evaluate(&frame(DriveStatus::empty()), start), Verdict::Pending);
        assert!(!cmd.acked);
        assert_eq!(
            cmd.evaluate(&frame(DriveStatus::EXECUTE_ACK), start),
            Verdict::Complete
        );
        assert!(cmd.acked);
    }

    #[test]
    fn ack_latches_even_when_still_pending() {
        let (mut cmd, start) = command(
            CompletionCriterion::AckWithTimeout(Duration::from_secs(1)),
            Duration::from_secs(1),
        );
        cmd.evaluate(&frame(DriveStatus::EXECUTE_ACK), start);
        assert!(cmd.acked);
        // The ack bit dropping later does not un-latch.
        cmd.evaluate(&frame(DriveStatus::empty()), start);
        assert!(cmd.acked);
    }

    #[test]
    fn ack_with_timeout_requires_both_conditions() {
        let hold = Duration::from_secs(1);
        let (mut cmd, start) = command(CompletionCriterion::AckWithTimeout(hold), hold);
        // Acked immediately, but the hold time has not elapsed.
        assert_eq!(
            cmd.evaluate(&frame(DriveStatus::EXECUTE_ACK), start),
            Verdict::Pending
        );
        assert_eq!(
            cmd.evaluate(&frame(DriveStatus::empty()), start + Duration::from_millis(999)),
            Verdict::Pending
        );
        // Hold elapsed with the ack latched.
        assert_eq!(
            cmd.evaluate(&frame(DriveStatus::empty()), start + hold),
            Verdict::Complete
        );
    }

    #[test]
    fn ack_with_timeout_fails_without_ack() {
        let hold = Duration::from_secs(1);
        let (mut cmd, start) = command(CompletionCriterion::AckWithTimeout(hold), hold);
        assert_eq!(
            cmd.evaluate(&frame(DriveStatus::empty()), start + Duration::from_millis(500)),
            Verdict::Pending
        );
        assert_eq!(
            cmd.evaluate(&frame(DriveStatus::empty()), start + hold),
            Verdict::TimedOut
        );
    }

    #[test]
    fn position_reached_seeds_before_judging() {
        let (mut cmd, start) = command(CompletionCriterion::PositionReached, Duration::from_secs(2));
        // The drive is already at rest with the flag latched: first
        // evaluation only seeds the scratch.
        let at_rest = frame(DriveStatus::POSITION_REACHED | DriveStatus::MOTOR_ON);
        assert_eq!(cmd.evaluate(&at_rest, start), Verdict::Pending);
        // The level alone never completes; a fresh edge is required.
        assert_eq!(cmd.evaluate(&at_rest, start), Verdict::Pending);

        let moving = frame(DriveStatus::MOTOR_ON);
        assert_eq!(cmd.evaluate(&moving, start), Verdict::Pending);
        assert_eq!(cmd.evaluate(&at_rest, start), Verdict::Complete);
    }

    #[test]
    fn position_reached_completes_on_motor_drop() {
        let (mut cmd, start) = command(CompletionCriterion::PositionReached, Duration::from_secs(2));
        let moving = frame(DriveStatus::MOTOR_ON);
        assert_eq!(cmd.evaluate(&moving, start), Verdict::Pending);
        assert_eq!(cmd.evaluate(&frame(DriveStatus::empty()), start), Verdict::Complete);
    }

    #[test]
    fn dpos_completes_on_exact_position_match() {
        let (mut cmd, _rx) = PendingCommand::new(CommandSpec {
            parameter: 42_000,
            ..spec(
                CommandKeyword::DPOS,
                CompletionCriterion::PositionReached,
                Duration::from_secs(2),
            )
        });
        let start = Instant::now();
        cmd.start(start);
        let mut tx = frame(DriveStatus::MOTOR_ON);
        assert_eq!(cmd.evaluate(&tx, start), Verdict::Pending);
        tx.actual_position = 42_000;
        assert_eq!(cmd.evaluate(&tx, start), Verdict::Complete);
    }

    #[test]
    fn position_match_ignored_for_non_dpos() {
        let (mut cmd, _rx) = PendingCommand::new(spec(
            CommandKeyword::SCAN,
            CompletionCriterion::PositionReached,
            Duration::ZERO,
        ));
        let start = Instant::now();
        cmd.start(start);
        let tx = frame(DriveStatus::MOTOR_ON);
        assert_eq!(cmd.evaluate(&tx, start), Verdict::Pending);
        // actual_position == parameter == 0, but the keyword is not DPOS.
        assert_eq!(cmd.evaluate(&tx, start), Verdict::Pending);
    }

    #[test]
    fn indexed_requires_both_flags() {
        let (mut cmd, start) = command(CompletionCriterion::Indexed, Duration::from_secs(2));
        assert_eq!(
            cmd.evaluate(&frame(DriveStatus::ENCODER_VALID), start),
            Verdict::Pending
        );
        assert_eq!(
            cmd.evaluate(&frame(DriveStatus::POSITION_REACHED), start),
            Verdict::Pending
        );
        assert_eq!(
            cmd.evaluate(
                &frame(DriveStatus::ENCODER_VALID | DriveStatus::POSITION_REACHED),
                start
            ),
            Verdict::Complete
        );
    }

    #[test]
    fn enabled_disabled_and_halt_criteria() {
        let (mut cmd, start) = command(CompletionCriterion::Enabled, Duration::from_millis(500));
        assert_eq!(
            cmd.evaluate(&frame(DriveStatus::AMPLIFIERS_ENABLED), start),
            Verdict::Pending
        );
        assert_eq!(
            cmd.evaluate(
                &frame(DriveStatus::AMPLIFIERS_ENABLED | DriveStatus::MOTOR_ON),
                start
            ),
            Verdict::Complete
        );

        let (mut cmd, start) = command(CompletionCriterion::Disabled, Duration::from_millis(500));
        assert_eq!(
            cmd.evaluate(&frame(DriveStatus::AMPLIFIERS_ENABLED), start),
            Verdict::Pending
        );
        assert_eq!(cmd.evaluate(&frame(DriveStatus::empty()), start), Verdict::Complete);

        let (mut cmd, start) = command(CompletionCriterion::Halt, Duration::from_secs(2));
        assert_eq!(cmd.evaluate(&frame(DriveStatus::SCANNING), start), Verdict::Pending);
        assert_eq!(cmd.evaluate(&frame(DriveStatus::empty()), start), Verdict::Complete);
    }

    #[test]
    fn nonzero_timeout_elapses() {
        let (mut cmd, start) = command(CompletionCriterion::AckOnly, Duration::from_secs(2));
        assert_eq!(
            cmd.evaluate(&frame(DriveStatus::empty()), start + Duration::from_secs(1)),
            Verdict::Pending
        );
        assert_eq!(
            cmd.evaluate(&frame(DriveStatus::empty()), start + Duration::from_secs(2)),
            Verdict::TimedOut
        );
    }

    #[test]
    fn zero_timeout_never_elapses() {
        let (mut cmd, start) = command(CompletionCriterion::AckOnly, Duration::ZERO);
        assert_eq!(
            cmd.evaluate(&frame(DriveStatus::empty()), start + Duration::from_secs(3600)),
            Verdict::Pending
        );
    }

    #[test]
    fn start_resets_ack_and_edge_scratch() {
        let (mut cmd, start) = command(CompletionCriterion::PositionReached, Duration::ZERO);
        cmd.evaluate(&frame(DriveStatus::EXECUTE_ACK | DriveStatus::POSITION_REACHED), start);
        assert!(cmd.acked);

        cmd.start(start + Duration::from_secs(1));
        assert!(!cmd.acked);
        // Scratch was cleared: next evaluation seeds again.
        let at_rest = frame(DriveStatus::POSITION_REACHED);
        assert_eq!(
            cmd.evaluate(&at_rest, start + Duration::from_secs(1)),
            Verdict::Pending
        );
    }

    #[test]
    fn cancellation_flag_is_shared() {
        let (cmd, _rx) = PendingCommand::new(spec(
            CommandKeyword::STOP,
            CompletionCriterion::AckOnly,
            Duration::ZERO,
        ));
        let handle = cmd.cancel_handle();
        assert!(!cmd.is_cancelled());
        handle.store(true, Ordering::Release);
        assert!(cmd.is_cancelled());
    }
}
