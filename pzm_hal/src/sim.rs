//! Simulated bus adapter.
//!
//! `SimAdapter` models a chain of piezo drives well enough to exercise the
//! orchestrator end to end: the execute/ack handshake, position moves,
//! scanning, index search, enable/disable, and reset. A shared
//! [`SimControls`] handle lets tests inject degraded working counters,
//! forced status bits, recovery outcomes, and AL status codes, and exposes
//! counters for lifecycle assertions.
//!
//! The model is deliberately coarse: one exchange advances every axis by
//! one simulation step, independent of wall-clock time.

use std::sync::{Arc, Mutex};

use pzm_common::frames::{CommandKeyword, DriveStatus, RxFrame, TxFrame};
use pzm_common::health::{HealthSnapshot, ERR_BAD_ARGS};
use tracing::debug;

use crate::adapter::{BusAdapter, HalError};

/// Status bits cleared by a drive reset.
const FAULT_BITS: DriveStatus = DriveStatus::THERMAL_PROTECTION_1
    .union(DriveStatus::THERMAL_PROTECTION_2)
    .union(DriveStatus::ENCODER_ERROR)
    .union(DriveStatus::ERROR_LIMIT)
    .union(DriveStatus::SAFETY_TIMEOUT)
    .union(DriveStatus::EMERGENCY_STOP)
    .union(DriveStatus::POSITION_FAIL)
    .union(DriveStatus::END_STOP)
    .union(DriveStatus::LEFT_END_STOP)
    .union(DriveStatus::RIGHT_END_STOP);

/// Bits granted by `ENBL 1` and revoked by `ENBL 0`.
const ENABLE_BITS: DriveStatus = DriveStatus::AMPLIFIERS_ENABLED
    .union(DriveStatus::MOTOR_ON)
    .union(DriveStatus::CLOSED_LOOP);

/// Exchanges an index search takes before the encoder reports valid.
const INDEX_SEARCH_TICKS: u8 = 3;

/// One simulated drive.
#[derive(Debug, Clone)]
struct SimSlave {
    position: i32,
    status: DriveStatus,
    slot: u8,
    /// Last staged output frame.
    staged: RxFrame,
    prev_execute: u8,
    target: i32,
    velocity: i32,
    moving: bool,
    scan_direction: i32,
    index_ticks_remaining: u8,
    ack_ticks_remaining: u8,
}

impl SimSlave {
    fn new(slot: u8, initial_status: DriveStatus) -> Self {
        Self {
            position: 0,
            status: initial_status,
            slot,
            staged: RxFrame::nop(),
            prev_execute: 0,
            target: 0,
            velocity: 0,
            moving: false,
            scan_direction: 0,
            index_ticks_remaining: 0,
            ack_ticks_remaining: 0,
        }
    }

    /// Counts moved per exchange at the given commanded velocity.
    fn step_size(velocity: i32) -> i32 {
        (velocity.abs() / 100).max(1)
    }

    fn latch_command(&mut self) {
        let frame = self.staged;
        let keyword = frame.command;
        if keyword == CommandKeyword::DPOS {
            self.target = frame.parameter;
            self.velocity = frame.velocity;
            self.moving = true;
            self.status.remove(DriveStatus::POSITION_REACHED);
        } else if keyword == CommandKeyword::SCAN {
            self.scan_direction = frame.parameter.signum();
            self.velocity = frame.velocity;
            if self.scan_direction == 0 {
                self.status.remove(DriveStatus::SCANNING);
            } else {
                self.status.insert(DriveStatus::SCANNING);
                self.status.remove(DriveStatus::POSITION_REACHED);
            }
        } else if keyword == CommandKeyword::INDX {
            self.status.insert(DriveStatus::SEARCHING_INDEX);
            self.status
                .remove(DriveStatus::ENCODER_VALID | DriveStatus::POSITION_REACHED);
            self.index_ticks_remaining = INDEX_SEARCH_TICKS;
        } else if keyword == CommandKeyword::ENBL {
            if frame.parameter != 0 {
                self.status.insert(ENABLE_BITS);
            } else {
                self.status.remove(ENABLE_BITS);
                self.moving = false;
                self.status.remove(DriveStatus::SCANNING);
            }
        } else if keyword == CommandKeyword::RSET {
            self.status.remove(FAULT_BITS);
            self.moving = false;
            self.scan_direction = 0;
            self.status.remove(DriveStatus::SCANNING);
            self.status.insert(DriveStatus::POSITION_REACHED);
        } else if keyword == CommandKeyword::HALT {
            self.scan_direction = 0;
            self.status.remove(DriveStatus::SCANNING);
        } else if keyword == CommandKeyword::STOP {
            self.moving = false;
            self.scan_direction = 0;
            self.status.remove(DriveStatus::SCANNING);
        }
    }

    /// Advance the drive by one exchange.
    fn step(&mut self, auto_ack: bool, ack_latency: u8) {
        let execute = self.staged.execute;

        // Command latch on the execute rising edge.
        if execute == 1 && self.prev_execute == 0 {
            self.latch_command();
            self.ack_ticks_remaining = ack_latency;
        }

        // Execute/ack handshake.
        if execute == 1 && auto_ack {
            if self.ack_ticks_remaining > 0 {
                self.ack_ticks_remaining -= 1;
            } else {
                self.status.insert(DriveStatus::EXECUTE_ACK);
            }
        }
        if execute == 0 {
            self.status.remove(DriveStatus::EXECUTE_ACK);
        }

        // Position move integration.
        if self.moving {
            let step = Self::step_size(self.velocity);
            let delta = self.target - self.position;
            if delta.abs() <= step {
                self.position = self.target;
                self.moving = false;
                self.status.insert(DriveStatus::POSITION_REACHED);
            } else {
                self.position += step * delta.signum();
            }
        }

        // Scanning drift.
        if self.status.contains(DriveStatus::SCANNING) {
            self.position += Self::step_size(self.velocity) * self.scan_direction;
        }

        // Index search.
        if self.index_ticks_remaining > 0 {
            self.index_ticks_remaining -= 1;
            if self.index_ticks_remaining == 0 {
                self.position = 0;
                self.status.remove(DriveStatus::SEARCHING_INDEX);
                self.status.insert(
                    DriveStatus::ENCODER_VALID
                        | DriveStatus::ENCODER_AT_INDEX
                        | DriveStatus::POSITION_REACHED,
                );
            }
        }

        self.prev_execute = execute;
    }
}

/// Shared injection and observation state.
#[derive(Debug)]
struct ControlState {
    auto_ack: bool,
    ack_latency: u8,
    forced_set: DriveStatus,
    forced_clear: DriveStatus,
    wkc_deficit: i32,
    exchange_result: Option<i32>,
    recover_result: i32,
    al_status_code: u32,
    fail_open: bool,
    slave_count_on_next_open: Option<usize>,
    queued_errors: String,
    opens: u32,
    closes: u32,
    recovers: u32,
}

impl Default for ControlState {
    fn default() -> Self {
        Self {
            auto_ack: true,
            ack_latency: 0,
            forced_set: DriveStatus::empty(),
            forced_clear: DriveStatus::empty(),
            wkc_deficit: 0,
            exchange_result: None,
            recover_result: 1,
            al_status_code: 0,
            fail_open: false,
            slave_count_on_next_open: None,
            queued_errors: String::new(),
            opens: 0,
            closes: 0,
            recovers: 0,
        }
    }
}

/// Test/demo handle into a [`SimAdapter`].
///
/// Cheap to clone; all clones observe and steer the same adapter.
#[derive(Debug, Clone, Default)]
pub struct SimControls {
    state: Arc<Mutex<ControlState>>,
}

impl SimControls {
    fn lock(&self) -> std::sync::MutexGuard<'_, ControlState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Disable or re-enable the automatic execute/ack handshake.
    pub fn set_auto_ack(&self, on: bool) {
        self.lock().auto_ack = on;
    }

    /// Exchanges between an execute rising edge and the ack bit.
    pub fn set_ack_latency(&self, ticks: u8) {
        self.lock().ack_latency = ticks;
    }

    /// OR the given bits into every slave's reported status.
    pub fn force_status(&self, set: DriveStatus) {
        self.lock().forced_set = set;
    }

    /// Clear the given bits from every slave's reported status.
    pub fn suppress_status(&self, clear: DriveStatus) {
        self.lock().forced_clear = clear;
    }

    /// Report a working counter this many below the expected value.
    pub fn set_wkc_deficit(&self, deficit: i32) {
        self.lock().wkc_deficit = deficit;
    }

    /// Force the next exchanges to return this value verbatim.
    pub fn force_exchange_result(&self, result: Option<i32>) {
        self.lock().exchange_result = result;
    }

    /// Value returned by the recovery primitive.
    pub fn set_recover_result(&self, result: i32) {
        self.lock().recover_result = result;
    }

    /// Reported application-layer status code.
    pub fn set_al_status_code(&self, code: u32) {
        self.lock().al_status_code = code;
    }

    /// Make `open()` fail until cleared.
    pub fn set_fail_open(&self, fail: bool) {
        self.lock().fail_open = fail;
    }

    /// Change the slave count reported by the next `open()`.
    pub fn set_slave_count_on_next_open(&self, count: usize) {
        self.lock().slave_count_on_next_open = Some(count);
    }

    /// Queue text for the adapter's error sink.
    pub fn queue_error(&self, text: &str) {
        let mut state = self.lock();
        state.queued_errors.push_str(text);
        state.queued_errors.push('\n');
    }

    /// Number of successful `open()` calls.
    pub fn opens(&self) -> u32 {
        self.lock().opens
    }

    /// Number of `close()` calls on an open adapter.
    pub fn closes(&self) -> u32 {
        self.lock().closes
    }

    /// Number of recovery attempts.
    pub fn recovers(&self) -> u32 {
        self.lock().recovers
    }
}

/// Deterministic simulated bus adapter.
pub struct SimAdapter {
    slave_total: usize,
    initial_status: DriveStatus,
    slaves: Vec<SimSlave>,
    open: bool,
    last_wkc: i32,
    controls: SimControls,
}

impl SimAdapter {
    /// A bus of `slaves` drives that power up disabled.
    pub fn new(slaves: usize) -> Self {
        Self {
            slave_total: slaves,
            initial_status: DriveStatus::empty(),
            slaves: Vec::new(),
            open: false,
            last_wkc: 0,
            controls: SimControls::default(),
        }
    }

    /// A bus of `slaves` drives that power up enabled, in closed loop,
    /// with a valid encoder and the position flag latched.
    pub fn ready(slaves: usize) -> Self {
        let mut adapter = Self::new(slaves);
        adapter.initial_status = ENABLE_BITS
            | DriveStatus::ENCODER_VALID
            | DriveStatus::POSITION_REACHED;
        adapter
    }

    /// Shared injection/observation handle.
    pub fn controls(&self) -> SimControls {
        self.controls.clone()
    }

    fn expected_wkc(&self) -> i32 {
        // outputs WKC counts twice, inputs once, per serviced slave.
        self.slaves.len() as i32 * 3
    }

    fn check_slave(&self, slave: u16) -> Result<usize, HalError> {
        if !self.open {
            return Err(HalError::NotOpen);
        }
        let index = usize::from(slave);
        if index == 0 || index > self.slaves.len() {
            return Err(HalError::InvalidSlave {
                slave,
                count: self.slaves.len(),
            });
        }
        Ok(index - 1)
    }
}

impl BusAdapter for SimAdapter {
    fn open(&mut self, interface: &str) -> Result<(), HalError> {
        let mut state = self.controls.lock();
        if state.fail_open {
            return Err(HalError::InitFailed(format!(
                "simulated open failure on {interface}"
            )));
        }
        if let Some(count) = state.slave_count_on_next_open.take() {
            self.slave_total = count;
        }
        state.opens += 1;
        drop(state);

        self.slaves = (0..self.slave_total)
            .map(|i| SimSlave::new(i as u8 + 1, self.initial_status))
            .collect();
        self.last_wkc = 0;
        self.open = true;
        debug!(interface, slaves = self.slave_total, "sim bus opened");
        Ok(())
    }

    fn close(&mut self) {
        if self.open {
            self.controls.lock().closes += 1;
            self.open = false;
            debug!("sim bus closed");
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn slave_count(&self) -> usize {
        if self.open {
            self.slaves.len()
        } else {
            0
        }
    }

    fn write_rx(&mut self, slave: u16, frame: &RxFrame) -> Result<(), HalError> {
        let index = self.check_slave(slave)?;
        self.slaves[index].staged = *frame;
        Ok(())
    }

    fn read_tx(&mut self, slave: u16) -> Result<TxFrame, HalError> {
        let index = self.check_slave(slave)?;
        let state = self.controls.lock();
        let drive = &self.slaves[index];
        let status = (drive.status | state.forced_set) - state.forced_clear;
        Ok(TxFrame {
            actual_position: drive.position,
            status,
            slot: drive.slot,
        })
    }

    fn exchange(&mut self, _timeout_us: u32) -> i32 {
        if !self.open {
            return ERR_BAD_ARGS;
        }
        let (auto_ack, ack_latency, deficit, forced) = {
            let state = self.controls.lock();
            (
                state.auto_ack,
                state.ack_latency,
                state.wkc_deficit,
                state.exchange_result,
            )
        };
        for drive in &mut self.slaves {
            drive.step(auto_ack, ack_latency);
        }
        self.last_wkc = (self.expected_wkc() - deficit).max(0);
        forced.unwrap_or(self.last_wkc)
    }

    fn health(&mut self) -> HealthSnapshot {
        let state = self.controls.lock();
        HealthSnapshot {
            slaves_found: self.slaves.len() as i32,
            group_expected_wkc: self.expected_wkc(),
            last_wkc: self.last_wkc,
            bytes_out: (self.slaves.len() * pzm_common::frames::RX_FRAME_WIRE_BYTES) as i32,
            bytes_in: (self.slaves.len() * pzm_common::frames::TX_FRAME_WIRE_BYTES) as i32,
            slaves_operational: self.slaves.len() as i32,
            al_status_code: state.al_status_code,
        }
    }

    fn recover(&mut self, _timeout_ms: u32) -> i32 {
        let mut state = self.controls.lock();
        state.recovers += 1;
        let result = state.recover_result;
        if result > 0 {
            // A successful recovery brings the lagging slaves back.
            state.wkc_deficit = 0;
        }
        result
    }

    fn drain_errors(&mut self) -> String {
        std::mem::take(&mut self.controls.lock().queued_errors)
    }
}
