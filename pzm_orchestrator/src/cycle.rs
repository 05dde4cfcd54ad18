//! The periodic I/O loop.
//!
//! One dedicated worker thread owns the bus adapter and all per-axis frame
//! state. Every tick runs the same phase sequence: drain ingest, stage
//! outputs, exchange process data, read health, classify the wire outcome,
//! process per-slave statuses and active commands, publish a snapshot, and
//! drain the adapter's error sink. The worker then sleeps out the rest of
//! the cycle period.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use pzm_common::error::OrchestratorError;
use pzm_common::fault::{classify, DriveErrorCode, DriveFault};
use pzm_common::frames::TxFrame;
use pzm_common::health::{classify_exchange, HealthSnapshot, WireOutcome};
use pzm_common::OrchestratorOptions;
use pzm_hal::BusAdapter;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::axis::AxisState;
use crate::command::{LatchEffect, PendingCommand, Verdict};
use crate::events::{DriveStatusChangeEvent, SoemFaultEvent};
use crate::orchestrator::SharedState;
use crate::recovery::{LadderAction, RecoveryLadder};
use crate::snapshot::{CycleStats, StatusSnapshot};

/// Pause after a successful in-place recovery before resuming exchanges.
const RECOVERY_SETTLE: Duration = Duration::from_millis(20);

/// Fault raised when a command times out in the loop.
const TIMEOUT_FAULT: DriveFault = DriveFault {
    code: DriveErrorCode::SafetyTimeout,
    message: "command timed out before completion",
    hint: "check the drive state; RSET or ENBL=1",
};

/// Fault raised when a non-zero application-layer status fails a command.
const AL_STATUS_FAULT: DriveFault = DriveFault {
    code: DriveErrorCode::UnknownFault,
    message: "application layer status fault",
    hint: "check the slave state; the session may need reinitialization",
};

pub(crate) struct CycleWorker {
    adapter: Box<dyn BusAdapter>,
    interface: String,
    options: OrchestratorOptions,
    shared: Arc<SharedState>,
    ingest: mpsc::UnboundedReceiver<PendingCommand>,
    axes: Vec<AxisState>,
    ladder: RecoveryLadder,
    stats: CycleStats,
    /// Status-change event sequence, strictly increasing across slaves.
    sequence: u64,
    /// Published snapshot sequence.
    tick_count: u64,
    /// Monotonic base for event tick stamps.
    epoch: Instant,
    /// Commands finished this tick; their promises resolve only after the
    /// snapshot swap so a woken caller never reads a stale snapshot.
    completions: Vec<(PendingCommand, Result<(), OrchestratorError>)>,
}

impl CycleWorker {
    /// Build a worker over an already opened adapter.
    pub fn new(
        adapter: Box<dyn BusAdapter>,
        interface: String,
        options: OrchestratorOptions,
        shared: Arc<SharedState>,
        ingest: mpsc::UnboundedReceiver<PendingCommand>,
    ) -> Self {
        let axes = (0..adapter.slave_count()).map(|_| AxisState::new()).collect();
        let ladder = RecoveryLadder::new(options.wkc_recovery_threshold);
        Self {
            adapter,
            interface,
            options,
            shared,
            ingest,
            axes,
            ladder,
            stats: CycleStats::new(),
            sequence: 0,
            tick_count: 0,
            epoch: Instant::now(),
            completions: Vec::new(),
        }
    }

    /// Run until the shared running flag drops, then fail whatever is
    /// still in flight and hand the adapter back.
    pub fn run(mut self) -> Box<dyn BusAdapter> {
        let period = self.options.cycle_period();
        info!(
            period_us = self.options.cycle_period_us,
            slaves = self.axes.len(),
            "I/O loop started"
        );

        while self.shared.running.load(Ordering::Acquire) {
            let cycle_start = Instant::now();
            self.tick(cycle_start);
            let elapsed = cycle_start.elapsed();
            self.stats.record(elapsed);
            if self.options.enable_cycle_trace_logging {
                trace!(
                    cycle = self.stats.count(),
                    elapsed_us = elapsed.as_micros() as u64,
                    "cycle complete"
                );
            }
            if let Some(remaining) = period.checked_sub(elapsed) {
                thread::sleep(remaining);
            }
        }

        self.finish();
        info!(cycles = self.stats.count(), "I/O loop stopped");
        self.adapter
    }

    /// One full tick: phases A through H.
    fn tick(&mut self, now: Instant) {
        // Phase A: ingest.
        self.drain_ingest(now);

        // Phase B: stage outputs.
        self.stage_outputs();

        // Phase C: exchange.
        let wkc = self.adapter.exchange(self.options.exchange_timeout_us);

        // Phase D: health.
        let mut health = self.adapter.health();

        // Phase E: wire classification and the recovery ladder.
        let outcome = classify_exchange(wkc, &health);
        if self.apply_ladder(outcome) {
            // Recovery or reinitialization ran; the counters are stale.
            health = self.adapter.health();
        }

        // Phase F: per-slave statuses, faults, and command evaluation.
        self.process_slaves(&health, now);

        // Phase G: snapshot publish.
        self.publish_snapshot(health);

        // Phase H: error sink drain.
        let errors = self.adapter.drain_errors();
        if !errors.is_empty() {
            error!("bus error sink: {}", errors.trim_end());
        }

        // Resolve promises last: the published snapshot already reflects
        // everything a woken caller might re-check (latches, statuses).
        for (cmd, result) in self.completions.drain(..) {
            cmd.resolve(result);
        }
    }

    /// Phase A: install queued commands into their axis slots.
    fn drain_ingest(&mut self, now: Instant) {
        while let Ok(mut cmd) = self.ingest.try_recv() {
            if cmd.is_cancelled() {
                cmd.resolve(Err(OrchestratorError::Cancelled));
                continue;
            }
            let slave = cmd.spec.slave;
            let index = match usize::from(slave).checked_sub(1) {
                Some(i) if i < self.axes.len() => i,
                _ => {
                    warn!(slave, "command addressed outside the active topology");
                    cmd.resolve(Err(OrchestratorError::Drive {
                        code: DriveErrorCode::UnknownFault,
                        message: format!("slave {slave} outside the active topology"),
                        hint: "check the bus configuration".to_string(),
                    }));
                    continue;
                }
            };
            // A cancelled occupant does not block a newcomer.
            if self.axes[index].active.as_ref().is_some_and(|c| c.is_cancelled()) {
                if let Some(old) = self.axes[index].active.take() {
                    old.resolve(Err(OrchestratorError::Cancelled));
                }
            }
            if self.axes[index].active.is_some() {
                cmd.resolve(Err(OrchestratorError::AlreadyInFlight { slave }));
                continue;
            }
            cmd.start(now);
            debug!(slave, keyword = %cmd.spec.keyword, "command installed");
            self.axes[index].active = Some(cmd);
        }
    }

    /// Phase B: mutate every output frame in place and hand it down.
    fn stage_outputs(&mut self) {
        for i in 0..self.axes.len() {
            let slave = i as u16 + 1;

            if self.axes[i].active.as_ref().is_some_and(|c| c.is_cancelled()) {
                if let Some(cmd) = self.axes[i].active.take() {
                    debug!(slave, "dropping cancelled command");
                    self.completions.push((cmd, Err(OrchestratorError::Cancelled)));
                }
            }

            let axis = &mut self.axes[i];
            match &axis.active {
                None => axis.rx.clear(),
                Some(cmd) => {
                    axis.rx.command = cmd.spec.keyword;
                    axis.rx.parameter = cmd.spec.parameter;
                    axis.rx.velocity = cmd.spec.velocity;
                    axis.rx.acceleration = cmd.spec.acceleration;
                    axis.rx.deceleration = cmd.spec.deceleration;
                    // Once acked, the request bit is driven low again.
                    axis.rx.execute = u8::from(!(cmd.acked && cmd.spec.requires_ack));
                }
            }

            let frame = self.axes[i].rx;
            if let Err(e) = self.adapter.write_rx(slave, &frame) {
                warn!(slave, error = %e, "write_rx failed");
            }
        }
    }

    /// Phase E escalation. Returns true when recovery or reinit ran.
    fn apply_ladder(&mut self, outcome: WireOutcome) -> bool {
        match self.ladder.observe(outcome) {
            LadderAction::None => false,
            LadderAction::Recover => {
                warn!("working counter degraded; attempting in-place recovery");
                let rc = self.adapter.recover(self.options.recovery_timeout_ms);
                self.ladder.recovery_attempted();
                if rc > 0 {
                    info!("bus recovery succeeded");
                    thread::sleep(RECOVERY_SETTLE);
                } else {
                    warn!(rc, "bus recovery failed; reinitializing session");
                    self.reinitialize();
                }
                true
            }
            LadderAction::Reinitialize => {
                error!("repeated fatal exchange errors; reinitializing session");
                self.reinitialize();
                true
            }
        }
    }

    /// Tear the bus session down and bring it back up.
    ///
    /// Every in-flight command is failed explicitly; a changed slave count
    /// reallocates the per-axis arrays. A failed re-open leaves the loop
    /// ticking so the ladder re-enters on the next exchange.
    fn reinitialize(&mut self) {
        let completions = &mut self.completions;
        for axis in &mut self.axes {
            if let Some(cmd) = axis.active.take() {
                completions.push((cmd, Err(OrchestratorError::SessionRestarted)));
            }
            axis.rx.clear();
        }
        self.adapter.close();
        thread::sleep(self.options.reinitialization_delay());
        match self.adapter.open(&self.interface) {
            Ok(()) => {
                let count = self.adapter.slave_count();
                if count != self.axes.len() {
                    warn!(
                        previous = self.axes.len(),
                        current = count,
                        "slave count changed across reinitialization"
                    );
                    self.axes = (0..count).map(|_| AxisState::new()).collect();
                }
                info!(slaves = count, "bus session reinitialized");
            }
            Err(e) => {
                error!(error = %e, "bus reinitialization failed; will keep retrying");
            }
        }
        self.ladder.reset();
    }

    /// Phase F: read every slave's input frame, decode faults, emit change
    /// events, and evaluate active commands.
    fn process_slaves(&mut self, health: &HealthSnapshot, now: Instant) {
        let repeat_interval = self.options.fault_repeat_interval();

        for i in 0..self.axes.len() {
            let slave = i as u16 + 1;

            self.axes[i].prev_tx = self.axes[i].tx;
            match self.adapter.read_tx(slave) {
                Ok(tx) => self.axes[i].tx = tx,
                Err(e) => trace!(slave, error = %e, "read_tx failed; keeping previous frame"),
            }
            let tx = self.axes[i].tx;
            let prev = self.axes[i].prev_tx;

            // Fault decode runs for every slave every tick, command or not.
            match classify(tx.status) {
                Some(fault) => {
                    if self.axes[i].throttle.admit(fault.code, now, repeat_interval) {
                        warn!(slave, code = ?fault.code, "{}", fault.message);
                        self.shared.events.publish_fault(SoemFaultEvent {
                            slave,
                            status_bits: tx.status,
                            error: fault,
                            health: *health,
                        });
                    }
                }
                None => self.axes[i].throttle.reset(),
            }

            // Change events only while a command is active on the axis.
            if let Some(cmd) = self.axes[i].active.as_ref() {
                let changed = tx.changed_bits(&prev);
                if changed != 0 || tx.actual_position != prev.actual_position {
                    self.sequence += 1;
                    self.shared.events.publish_status(DriveStatusChangeEvent {
                        slave,
                        timestamp: SystemTime::now(),
                        monotonic_ticks: self.epoch.elapsed().as_nanos() as u64,
                        sequence: self.sequence,
                        current: tx,
                        previous: prev,
                        changed_bits_mask: changed,
                        active_command_keyword: cmd.spec.keyword,
                    });
                }
            }

            self.evaluate_axis(i, &tx, health, now, repeat_interval);
        }
    }

    /// Step 3-5 of the per-command evaluation for one axis.
    fn evaluate_axis(
        &mut self,
        index: usize,
        tx: &TxFrame,
        health: &HealthSnapshot,
        now: Instant,
        repeat_interval: Duration,
    ) {
        let slave = index as u16 + 1;

        if self.axes[index].active.as_ref().is_some_and(|c| c.is_cancelled()) {
            if let Some(cmd) = self.axes[index].active.take() {
                debug!(slave, "dropping cancelled command");
                self.completions.push((cmd, Err(OrchestratorError::Cancelled)));
            }
            return;
        }

        if self.axes[index].active.is_some() && health.al_status_code != 0 {
            if let Some(cmd) = self.axes[index].active.take() {
                self.raise_fault(index, AL_STATUS_FAULT, tx, health, now, repeat_interval);
                let failure = OrchestratorError::Drive {
                    code: DriveErrorCode::UnknownFault,
                    message: format!(
                        "application layer status code 0x{:04x}",
                        health.al_status_code
                    ),
                    hint: AL_STATUS_FAULT.hint.to_string(),
                };
                self.completions.push((cmd, Err(failure)));
            }
            return;
        }

        let verdict = match self.axes[index].active.as_mut() {
            Some(cmd) => cmd.evaluate(tx, now),
            None => return,
        };

        match verdict {
            Verdict::Pending => {}
            Verdict::Complete => {
                if let Some(cmd) = self.axes[index].active.take() {
                    match cmd.spec.latch {
                        LatchEffect::None => {}
                        LatchEffect::Set => self.shared.set_stop_latch(index, true),
                        LatchEffect::Clear => self.shared.set_stop_latch(index, false),
                    }
                    debug!(slave, keyword = %cmd.spec.keyword, "command completed");
                    self.completions.push((cmd, Ok(())));
                }
            }
            Verdict::TimedOut => {
                if let Some(cmd) = self.axes[index].active.take() {
                    self.raise_fault(index, TIMEOUT_FAULT, tx, health, now, repeat_interval);
                    warn!(slave, keyword = %cmd.spec.keyword, "command timed out");
                    let failure = OrchestratorError::Drive {
                        code: DriveErrorCode::SafetyTimeout,
                        message: format!(
                            "{} timed out after {:?}",
                            cmd.spec.keyword, cmd.spec.timeout
                        ),
                        hint: TIMEOUT_FAULT.hint.to_string(),
                    };
                    self.completions.push((cmd, Err(failure)));
                }
            }
        }
    }

    /// Publish a loop-raised fault through the per-axis throttle.
    fn raise_fault(
        &mut self,
        index: usize,
        fault: DriveFault,
        tx: &TxFrame,
        health: &HealthSnapshot,
        now: Instant,
        repeat_interval: Duration,
    ) {
        if self.axes[index].throttle.admit(fault.code, now, repeat_interval) {
            self.shared.events.publish_fault(SoemFaultEvent {
                slave: index as u16 + 1,
                status_bits: tx.status,
                error: fault,
                health: *health,
            });
        }
    }

    /// Phase G: build and swap in a fresh immutable snapshot.
    fn publish_snapshot(&mut self, health: HealthSnapshot) {
        self.tick_count += 1;
        self.shared.snapshot.publish(StatusSnapshot {
            sequence: self.tick_count,
            timestamp: SystemTime::now(),
            health,
            drive_states: self.axes.iter().map(|a| a.tx).collect(),
            cycle_time: self.stats.last(),
            min_cycle: self.stats.min(),
            max_cycle: self.stats.max(),
        });
    }

    /// Loop exit: fail everything still in flight and close the bus.
    fn finish(&mut self) {
        for axis in &mut self.axes {
            if let Some(cmd) = axis.active.take() {
                cmd.resolve(Err(OrchestratorError::SessionEnded));
            }
        }
        self.ingest.close();
        while let Ok(cmd) = self.ingest.try_recv() {
            cmd.resolve(Err(OrchestratorError::SessionEnded));
        }
        self.adapter.close();
    }
}
