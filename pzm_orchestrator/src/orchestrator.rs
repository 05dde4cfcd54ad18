//! Public orchestrator surface.
//!
//! `DriveOrchestrator` owns the session lifecycle and exposes the
//! asynchronous drive operations. Each operation validates its arguments
//! and the axis's current status, serializes against other callers through
//! a per-axis gate, enqueues a pending command to the I/O loop, and awaits
//! the command's completion promise. Dropping an operation future cancels
//! the command.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use pzm_common::error::OrchestratorError;
use pzm_common::frames::{CommandKeyword, DriveStatus};
use pzm_common::OrchestratorOptions;
use pzm_hal::BusAdapter;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tracing::{error, info};

use crate::command::{CommandSpec, CompletionCriterion, LatchEffect, PendingCommand};
use crate::cycle::CycleWorker;
use crate::events::{DriveStatusChangeEvent, SoemFaultEvent};
use crate::events::EventBus;
use crate::snapshot::{SnapshotPublisher, StatusSnapshot};

/// Hold time and timeout of the `RSET` ack handshake.
const RESET_HOLD: Duration = Duration::from_secs(1);
/// Timeout of the `ENBL` handshake.
const ENABLE_TIMEOUT: Duration = Duration::from_millis(500);
/// Timeout of `HALT` and `STOP`.
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// State shared between the loop thread and callers.
///
/// The loop owns everything else: the adapter, the frame arrays, the
/// active-command slots, and the fault throttle.
pub(crate) struct SharedState {
    /// Lock-free snapshot slot, swapped by the loop every tick.
    pub snapshot: SnapshotPublisher,
    /// Status-change and fault fan-out.
    pub events: EventBus,
    /// Per-axis caller gates; the loop never takes these.
    pub gates: Vec<Mutex<()>>,
    /// Per-axis stop latches; written by the loop, read by callers.
    stop_latches: Vec<AtomicBool>,
    /// Loop keep-running flag.
    pub running: AtomicBool,
    /// Topology size at initialization.
    pub slave_count: usize,
}

impl SharedState {
    pub fn new(slaves: usize) -> Self {
        Self {
            snapshot: SnapshotPublisher::new(StatusSnapshot::empty(slaves)),
            events: EventBus::new(),
            gates: (0..slaves).map(|_| Mutex::new(())).collect(),
            stop_latches: (0..slaves).map(|_| AtomicBool::new(false)).collect(),
            running: AtomicBool::new(true),
            slave_count: slaves,
        }
    }

    pub fn stop_latched(&self, index: usize) -> bool {
        self.stop_latches
            .get(index)
            .map(|latch| latch.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub fn set_stop_latch(&self, index: usize, latched: bool) {
        if let Some(latch) = self.stop_latches.get(index) {
            latch.store(latched, Ordering::Release);
        }
    }
}

struct Session {
    shared: Arc<SharedState>,
    ingest: mpsc::UnboundedSender<PendingCommand>,
    worker: std::sync::Mutex<Option<std::thread::JoinHandle<Box<dyn BusAdapter>>>>,
}

/// Sets the command's cancelled bit if the operation future is dropped
/// before the promise resolves.
struct CancelOnDrop {
    flag: Arc<AtomicBool>,
    armed: bool,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.flag.store(true, Ordering::Release);
        }
    }
}

/// High-level orchestrator for a fieldbus network of piezo-motion drives.
pub struct DriveOrchestrator {
    options: OrchestratorOptions,
    /// Adapter parked here while no session is running.
    adapter: std::sync::Mutex<Option<Box<dyn BusAdapter>>>,
    session: ArcSwapOption<Session>,
    /// Serializes initialize/shutdown against each other.
    lifecycle: Mutex<()>,
}

impl DriveOrchestrator {
    /// Build an orchestrator over the given adapter. No bus activity
    /// happens until [`initialize`](Self::initialize).
    pub fn new(adapter: Box<dyn BusAdapter>, options: OrchestratorOptions) -> Self {
        Self {
            options,
            adapter: std::sync::Mutex::new(Some(adapter)),
            session: ArcSwapOption::from(None),
            lifecycle: Mutex::new(()),
        }
    }

    /// Open the bus on `interface`, discover slaves, and start the I/O loop.
    ///
    /// # Errors
    ///
    /// `AlreadyInitialized` if a session is running, `AdapterOpenFailed` if
    /// the bus cannot be opened, `NoSlaves` if the bus came up empty.
    pub async fn initialize(&self, interface: &str) -> Result<(), OrchestratorError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.session.load().is_some() {
            return Err(OrchestratorError::AlreadyInitialized);
        }
        let mut adapter = self
            .take_adapter()
            .ok_or(OrchestratorError::AlreadyInitialized)?;

        if let Err(e) = adapter.open(interface) {
            self.park_adapter(adapter);
            return Err(OrchestratorError::AdapterOpenFailed(e.to_string()));
        }
        let slaves = adapter.slave_count();
        if slaves == 0 {
            adapter.close();
            self.park_adapter(adapter);
            return Err(OrchestratorError::NoSlaves);
        }

        let shared = Arc::new(SharedState::new(slaves));
        let (ingest, ingest_rx) = mpsc::unbounded_channel();
        let worker = CycleWorker::new(
            adapter,
            interface.to_string(),
            self.options.clone(),
            Arc::clone(&shared),
            ingest_rx,
        );
        let handle = std::thread::Builder::new()
            .name("pzm-io-loop".to_string())
            .spawn(move || worker.run())
            .map_err(|e| {
                OrchestratorError::AdapterOpenFailed(format!("failed to spawn I/O loop: {e}"))
            })?;

        self.session.store(Some(Arc::new(Session {
            shared,
            ingest,
            worker: std::sync::Mutex::new(Some(handle)),
        })));
        info!(interface, slaves, "orchestrator initialized");
        Ok(())
    }

    /// Stop the I/O loop, fail all in-flight commands, and close the bus.
    /// Idempotent after the first call.
    pub async fn shutdown(&self) -> Result<(), OrchestratorError> {
        let _lifecycle = self.lifecycle.lock().await;
        let Some(session) = self.session.swap(None) else {
            return Ok(());
        };
        session.shared.running.store(false, Ordering::Release);

        let handle = session
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            match tokio::task::spawn_blocking(move || handle.join()).await {
                Ok(Ok(adapter)) => self.park_adapter(adapter),
                Ok(Err(_)) => error!("I/O loop thread panicked during shutdown"),
                Err(e) => error!(error = %e, "failed to join I/O loop thread"),
            }
        }
        info!("orchestrator shut down");
        Ok(())
    }

    /// The number of slaves discovered at initialization.
    pub fn slave_count(&self) -> Result<usize, OrchestratorError> {
        Ok(self.require_session()?.shared.slave_count)
    }

    /// Latest status snapshot. Lock-free; safe from any thread.
    pub fn get_status(&self) -> Result<Arc<StatusSnapshot>, OrchestratorError> {
        Ok(self.require_session()?.shared.snapshot.load())
    }

    /// Subscribe to the status-change stream.
    pub fn status_changed(
        &self,
    ) -> Result<broadcast::Receiver<DriveStatusChangeEvent>, OrchestratorError> {
        Ok(self.require_session()?.shared.events.subscribe_status())
    }

    /// Subscribe to the fault stream.
    pub fn faulted(&self) -> Result<broadcast::Receiver<SoemFaultEvent>, OrchestratorError> {
        Ok(self.require_session()?.shared.events.subscribe_faults())
    }

    /// Move an axis to an absolute position; completes on a fresh
    /// PositionReached edge, a MotorOn drop, or an exact position match.
    pub async fn move_absolute(
        &self,
        slave: u16,
        target: i32,
        velocity: i32,
        acceleration: u16,
        deceleration: u16,
        settle: Option<Duration>,
    ) -> Result<(), OrchestratorError> {
        let session = self.require_session()?;
        let (index, status) = self.axis_status(&session, slave)?;
        self.require_ready(
            slave,
            status,
            &[
                (DriveStatus::AMPLIFIERS_ENABLED, "amplifier disabled"),
                (DriveStatus::MOTOR_ON, "motor off"),
                (DriveStatus::CLOSED_LOOP, "open loop"),
                (DriveStatus::ENCODER_VALID, "encoder not valid"),
            ],
        )?;
        self.require_unlatched(&session, slave, index)?;

        self.dispatch(
            &session,
            index,
            CommandSpec {
                slave,
                keyword: CommandKeyword::DPOS,
                parameter: target,
                velocity,
                acceleration,
                deceleration,
                requires_ack: true,
                criterion: CompletionCriterion::PositionReached,
                timeout: settle.unwrap_or_else(|| self.options.default_settle_timeout()),
                latch: LatchEffect::None,
            },
        )
        .await
    }

    /// Start a continuous scan in the given direction (-1, 0, or 1);
    /// completes on the drive's ack.
    pub async fn jog(
        &self,
        slave: u16,
        direction: i32,
        velocity: i32,
        acceleration: u16,
        deceleration: u16,
    ) -> Result<(), OrchestratorError> {
        if !(-1..=1).contains(&direction) {
            return Err(OrchestratorError::InvalidArgument(format!(
                "jog direction must be -1, 0, or 1 (got {direction})"
            )));
        }
        let session = self.require_session()?;
        let (index, status) = self.axis_status(&session, slave)?;
        self.require_ready(
            slave,
            status,
            &[
                (DriveStatus::AMPLIFIERS_ENABLED, "amplifier disabled"),
                (DriveStatus::MOTOR_ON, "motor off"),
                (DriveStatus::CLOSED_LOOP, "open loop"),
            ],
        )?;
        self.require_unlatched(&session, slave, index)?;

        self.dispatch(
            &session,
            index,
            CommandSpec {
                slave,
                keyword: CommandKeyword::SCAN,
                parameter: direction,
                velocity,
                acceleration,
                deceleration,
                requires_ack: true,
                criterion: CompletionCriterion::AckOnly,
                timeout: Duration::ZERO,
                latch: LatchEffect::None,
            },
        )
        .await
    }

    /// Run an encoder index search in the given direction (0 or 1);
    /// completes when the encoder is valid and the position settled.
    /// Resolves immediately if the encoder is already valid.
    pub async fn index(
        &self,
        slave: u16,
        direction: i32,
        velocity: i32,
        acceleration: u16,
        deceleration: u16,
        settle: Option<Duration>,
    ) -> Result<(), OrchestratorError> {
        if !(0..=1).contains(&direction) {
            return Err(OrchestratorError::InvalidArgument(format!(
                "index direction must be 0 or 1 (got {direction})"
            )));
        }
        let session = self.require_session()?;
        let (index, status) = self.axis_status(&session, slave)?;
        self.require_ready(
            slave,
            status,
            &[(DriveStatus::AMPLIFIERS_ENABLED, "amplifier disabled")],
        )?;
        self.require_unlatched(&session, slave, index)?;

        if status.contains(DriveStatus::ENCODER_VALID) {
            return Ok(());
        }

        self.dispatch(
            &session,
            index,
            CommandSpec {
                slave,
                keyword: CommandKeyword::INDX,
                parameter: direction,
                velocity,
                acceleration,
                deceleration,
                requires_ack: true,
                criterion: CompletionCriterion::Indexed,
                timeout: settle.unwrap_or_else(|| self.options.default_settle_timeout()),
                latch: LatchEffect::None,
            },
        )
        .await
    }

    /// Reset the drive. Completes only after the drive acks AND one full
    /// second has elapsed; clears the stop latch.
    pub async fn reset(&self, slave: u16) -> Result<(), OrchestratorError> {
        let session = self.require_session()?;
        let (index, _) = self.axis_status(&session, slave)?;

        self.dispatch(
            &session,
            index,
            CommandSpec {
                slave,
                keyword: CommandKeyword::RSET,
                parameter: 0,
                velocity: 0,
                acceleration: 0,
                deceleration: 0,
                requires_ack: true,
                criterion: CompletionCriterion::AckWithTimeout(RESET_HOLD),
                timeout: RESET_HOLD,
                latch: LatchEffect::Clear,
            },
        )
        .await
    }

    /// Enable or disable the amplifier. Enabling clears the stop latch.
    /// Resolves without dispatching if the axis is already in the target
    /// state.
    pub async fn enable(&self, slave: u16, on: bool) -> Result<(), OrchestratorError> {
        let session = self.require_session()?;
        let (index, status) = self.axis_status(&session, slave)?;

        let already = if on {
            status.contains(DriveStatus::AMPLIFIERS_ENABLED | DriveStatus::MOTOR_ON)
        } else {
            !status.contains(DriveStatus::AMPLIFIERS_ENABLED)
        };
        if already {
            if on {
                session.shared.set_stop_latch(index, false);
            }
            return Ok(());
        }

        self.dispatch(
            &session,
            index,
            CommandSpec {
                slave,
                keyword: CommandKeyword::ENBL,
                parameter: i32::from(on),
                velocity: 0,
                acceleration: 0,
                deceleration: 0,
                requires_ack: true,
                criterion: if on {
                    CompletionCriterion::Enabled
                } else {
                    CompletionCriterion::Disabled
                },
                timeout: ENABLE_TIMEOUT,
                latch: if on { LatchEffect::Clear } else { LatchEffect::None },
            },
        )
        .await
    }

    /// Halt scanning motion; completes when the Scanning flag drops.
    pub async fn halt(&self, slave: u16) -> Result<(), OrchestratorError> {
        let session = self.require_session()?;
        let (index, _) = self.axis_status(&session, slave)?;

        self.dispatch(
            &session,
            index,
            CommandSpec {
                slave,
                keyword: CommandKeyword::HALT,
                parameter: 0,
                velocity: 0,
                acceleration: 0,
                deceleration: 0,
                requires_ack: true,
                criterion: CompletionCriterion::Halt,
                timeout: STOP_TIMEOUT,
                latch: LatchEffect::None,
            },
        )
        .await
    }

    /// Stop the axis and latch it against further motion until `reset` or
    /// `enable(true)`.
    pub async fn stop(&self, slave: u16) -> Result<(), OrchestratorError> {
        let session = self.require_session()?;
        let (index, _) = self.axis_status(&session, slave)?;

        self.dispatch(
            &session,
            index,
            CommandSpec {
                slave,
                keyword: CommandKeyword::STOP,
                parameter: 0,
                velocity: 0,
                acceleration: 0,
                deceleration: 0,
                requires_ack: true,
                criterion: CompletionCriterion::AckOnly,
                timeout: STOP_TIMEOUT,
                latch: LatchEffect::Set,
            },
        )
        .await
    }

    /// Send an arbitrary drive command; completes on ack.
    #[allow(clippy::too_many_arguments)]
    pub async fn send_raw(
        &self,
        slave: u16,
        keyword: &str,
        parameter: i32,
        velocity: i32,
        acceleration: u16,
        deceleration: u16,
        requires_ack: bool,
        timeout: Duration,
    ) -> Result<(), OrchestratorError> {
        let keyword = CommandKeyword::parse(keyword)?;
        let session = self.require_session()?;
        let (index, _) = self.axis_status(&session, slave)?;

        self.dispatch(
            &session,
            index,
            CommandSpec {
                slave,
                keyword,
                parameter,
                velocity,
                acceleration,
                deceleration,
                requires_ack,
                criterion: CompletionCriterion::AckOnly,
                timeout,
                latch: LatchEffect::None,
            },
        )
        .await
    }

    // ── internals ──

    fn take_adapter(&self) -> Option<Box<dyn BusAdapter>> {
        self.adapter.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn park_adapter(&self, adapter: Box<dyn BusAdapter>) {
        *self.adapter.lock().unwrap_or_else(|e| e.into_inner()) = Some(adapter);
    }

    fn require_session(&self) -> Result<Arc<Session>, OrchestratorError> {
        self.session
            .load_full()
            .ok_or(OrchestratorError::NotInitialized)
    }

    /// Validate the slave number and fetch the axis's latest status.
    fn axis_status(
        &self,
        session: &Session,
        slave: u16,
    ) -> Result<(usize, DriveStatus), OrchestratorError> {
        if slave == 0 {
            return Err(OrchestratorError::InvalidArgument(
                "slave numbers start at 1".to_string(),
            ));
        }
        let index = usize::from(slave) - 1;
        if index >= session.shared.slave_count {
            return Err(OrchestratorError::SlaveOutOfRange {
                slave,
                count: session.shared.slave_count,
            });
        }
        let snapshot = session.shared.snapshot.load();
        let status = snapshot
            .drive_states
            .get(index)
            .map(|tx| tx.status)
            .unwrap_or_default();
        Ok((index, status))
    }

    fn require_ready(
        &self,
        slave: u16,
        status: DriveStatus,
        required: &[(DriveStatus, &str)],
    ) -> Result<(), OrchestratorError> {
        let missing: Vec<&str> = required
            .iter()
            .filter(|(flag, _)| !status.contains(*flag))
            .map(|(_, what)| *what)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(OrchestratorError::NotReady {
                slave,
                missing: missing.join(", "),
            })
        }
    }

    fn require_unlatched(
        &self,
        session: &Session,
        slave: u16,
        index: usize,
    ) -> Result<(), OrchestratorError> {
        if session.shared.stop_latched(index) {
            Err(OrchestratorError::Latched { slave })
        } else {
            Ok(())
        }
    }

    /// Gate, enqueue, await. Dropping the returned future cancels the
    /// command at the loop's next phase.
    async fn dispatch(
        &self,
        session: &Arc<Session>,
        index: usize,
        spec: CommandSpec,
    ) -> Result<(), OrchestratorError> {
        let gate = session
            .shared
            .gates
            .get(index)
            .ok_or(OrchestratorError::SlaveOutOfRange {
                slave: spec.slave,
                count: session.shared.slave_count,
            })?;
        let _serialized = gate.lock().await;

        let (command, done) = PendingCommand::new(spec);
        let mut cancel = CancelOnDrop {
            flag: command.cancel_handle(),
            armed: true,
        };
        session
            .ingest
            .send(command)
            .map_err(|_| OrchestratorError::SessionEnded)?;

        let result = await_promise(done).await;
        cancel.armed = false;
        result
    }
}

impl Drop for DriveOrchestrator {
    fn drop(&mut self) {
        // Without an explicit shutdown the loop thread must still wind
        // down; it fails in-flight commands and closes the bus on exit.
        if let Some(session) = self.session.swap(None) {
            session.shared.running.store(false, Ordering::Release);
        }
    }
}

async fn await_promise(
    done: oneshot::Receiver<Result<(), OrchestratorError>>,
) -> Result<(), OrchestratorError> {
    match done.await {
        Ok(result) => result,
        // The loop dropped the sender without resolving; session is gone.
        Err(_) => Err(OrchestratorError::SessionEnded),
    }
}
