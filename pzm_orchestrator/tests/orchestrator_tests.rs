//! Lifecycle and public-API tests against the simulated bus.

use std::sync::Arc;
use std::time::{Duration, Instant};

use pzm_common::error::OrchestratorError;
use pzm_common::fault::DriveErrorCode;
use pzm_common::OrchestratorOptions;
use pzm_hal::{SimAdapter, SimControls};
use pzm_orchestrator::{DriveOrchestrator, StatusSnapshot};

fn fast_options() -> OrchestratorOptions {
    OrchestratorOptions {
        cycle_period_us: 1_000,
        reinitialization_delay_ms: 10,
        ..OrchestratorOptions::default()
    }
}

/// Poll the snapshot until the predicate holds (or give up loudly).
async fn wait_for<F>(orchestrator: &DriveOrchestrator, what: &str, predicate: F)
where
    F: Fn(&StatusSnapshot) -> bool,
{
    for _ in 0..2_000 {
        if predicate(&orchestrator.get_status().unwrap()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("timed out waiting for {what}");
}

/// An initialized orchestrator over ready (enabled, encoder-valid) drives,
/// with at least one real snapshot published.
async fn ready_orchestrator(slaves: usize) -> (DriveOrchestrator, SimControls) {
    let adapter = SimAdapter::ready(slaves);
    let controls = adapter.controls();
    let orchestrator = DriveOrchestrator::new(Box::new(adapter), fast_options());
    orchestrator.initialize("sim0").await.unwrap();
    wait_for(&orchestrator, "first snapshot", |s| s.sequence >= 2).await;
    (orchestrator, controls)
}

#[tokio::test(flavor = "multi_thread")]
async fn operations_require_initialization() {
    let orchestrator =
        DriveOrchestrator::new(Box::new(SimAdapter::ready(1)), fast_options());
    assert!(matches!(
        orchestrator.get_status(),
        Err(OrchestratorError::NotInitialized)
    ));
    assert!(matches!(
        orchestrator.slave_count(),
        Err(OrchestratorError::NotInitialized)
    ));
    assert_eq!(
        orchestrator.stop(1).await,
        Err(OrchestratorError::NotInitialized)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn initialize_twice_fails() {
    let (orchestrator, _controls) = ready_orchestrator(2).await;
    assert_eq!(
        orchestrator.initialize("sim0").await,
        Err(OrchestratorError::AlreadyInitialized)
    );
    orchestrator.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_bus_fails_with_no_slaves() {
    let orchestrator =
        DriveOrchestrator::new(Box::new(SimAdapter::ready(0)), fast_options());
    assert_eq!(
        orchestrator.initialize("sim0").await,
        Err(OrchestratorError::NoSlaves)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn open_failure_is_recoverable() {
    let adapter = SimAdapter::ready(1);
    let controls = adapter.controls();
    let orchestrator = DriveOrchestrator::new(Box::new(adapter), fast_options());

    controls.set_fail_open(true);
    assert!(matches!(
        orchestrator.initialize("sim0").await,
        Err(OrchestratorError::AdapterOpenFailed(_))
    ));

    // The adapter was handed back; a later initialize succeeds.
    controls.set_fail_open(false);
    orchestrator.initialize("sim0").await.unwrap();
    assert_eq!(orchestrator.slave_count().unwrap(), 1);
    orchestrator.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_is_idempotent_and_uninitializes() {
    let (orchestrator, _controls) = ready_orchestrator(1).await;
    orchestrator.shutdown().await.unwrap();
    orchestrator.shutdown().await.unwrap();
    assert!(matches!(
        orchestrator.get_status(),
        Err(OrchestratorError::NotInitialized)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_fails_commands_in_flight() {
    let (orchestrator, controls) = ready_orchestrator(1).await;
    controls.set_auto_ack(false);

    let orchestrator = Arc::new(orchestrator);
    let background = Arc::clone(&orchestrator);
    let pending = tokio::spawn(async move { background.stop(1).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    orchestrator.shutdown().await.unwrap();
    assert_eq!(pending.await.unwrap(), Err(OrchestratorError::SessionEnded));
}

#[tokio::test(flavor = "multi_thread")]
async fn argument_validation() {
    let (orchestrator, _controls) = ready_orchestrator(2).await;

    assert!(matches!(
        orchestrator.jog(1, 5, 1_000, 100, 100).await,
        Err(OrchestratorError::InvalidArgument(_))
    ));
    assert!(matches!(
        orchestrator.index(1, 2, 1_000, 100, 100, None).await,
        Err(OrchestratorError::InvalidArgument(_))
    ));
    assert!(matches!(
        orchestrator.stop(0).await,
        Err(OrchestratorError::InvalidArgument(_))
    ));
    assert_eq!(
        orchestrator.stop(3).await,
        Err(OrchestratorError::SlaveOutOfRange { slave: 3, count: 2 })
    );
    assert!(matches!(
        orchestrator
            .send_raw(1, &"X".repeat(40), 0, 0, 0, 0, true, Duration::from_secs(1))
            .await,
        Err(OrchestratorError::InvalidArgument(_))
    ));
    assert!(matches!(
        orchestrator
            .send_raw(1, "", 0, 0, 0, 0, true, Duration::from_secs(1))
            .await,
        Err(OrchestratorError::InvalidArgument(_))
    ));

    orchestrator.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn send_raw_uppercases_and_completes_on_ack() {
    let (orchestrator, _controls) = ready_orchestrator(1).await;
    orchestrator
        .send_raw(1, "srno", 0, 0, 0, 0, true, Duration::from_secs(2))
        .await
        .unwrap();
    orchestrator.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn reset_holds_for_a_full_second() {
    let (orchestrator, _controls) = ready_orchestrator(1).await;
    let begun = Instant::now();
    orchestrator.reset(1).await.unwrap();
    assert!(begun.elapsed() >= Duration::from_secs(1));
    orchestrator.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn enable_and_index_are_idempotent_on_ready_axes() {
    let (orchestrator, _controls) = ready_orchestrator(1).await;

    // The axis is already enabled and encoder-valid: both resolve fast,
    // well inside a handful of cycle periods.
    let begun = Instant::now();
    orchestrator.enable(1, true).await.unwrap();
    orchestrator.index(1, 0, 1_000, 100, 100, None).await.unwrap();
    assert!(begun.elapsed() < Duration::from_millis(100));

    orchestrator.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn enable_false_disables_the_axis() {
    let (orchestrator, _controls) = ready_orchestrator(1).await;
    orchestrator.enable(1, false).await.unwrap();
    wait_for(&orchestrator, "amplifier off", |s| {
        !s.drive_states[0]
            .status
            .contains(pzm_common::DriveStatus::AMPLIFIERS_ENABLED)
    })
    .await;

    // Motion on a disabled axis is rejected up front.
    match orchestrator.move_absolute(1, 1_000, 1_000, 100, 100, None).await {
        Err(OrchestratorError::NotReady { slave: 1, missing }) => {
            assert!(missing.contains("amplifier"));
        }
        other => panic!("expected NotReady, got {other:?}"),
    }
    orchestrator.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn jog_then_halt() {
    let (orchestrator, _controls) = ready_orchestrator(1).await;

    orchestrator.jog(1, 1, 5_000, 100, 100).await.unwrap();
    wait_for(&orchestrator, "scanning", |s| {
        s.drive_states[0]
            .status
            .contains(pzm_common::DriveStatus::SCANNING)
    })
    .await;

    orchestrator.halt(1).await.unwrap();
    let snapshot = orchestrator.get_status().unwrap();
    assert!(!snapshot.drive_states[0]
        .status
        .contains(pzm_common::DriveStatus::SCANNING));

    orchestrator.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn dropping_an_operation_future_cancels_the_command() {
    let (orchestrator, controls) = ready_orchestrator(1).await;
    controls.set_auto_ack(false);

    // The stop can never ack; time it out caller-side, dropping the future.
    let result =
        tokio::time::timeout(Duration::from_millis(100), orchestrator.stop(1)).await;
    assert!(result.is_err(), "stop should still have been pending");

    // The loop drops the cancelled command; the axis accepts new work.
    controls.set_auto_ack(true);
    tokio::time::sleep(Duration::from_millis(20)).await;
    orchestrator.stop(1).await.unwrap();

    orchestrator.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn snapshot_sequences_increase_and_track_cycle_stats() {
    let (orchestrator, _controls) = ready_orchestrator(1).await;
    let first = orchestrator.get_status().unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = orchestrator.get_status().unwrap();

    assert!(second.sequence > first.sequence);
    assert!(second.max_cycle >= second.min_cycle);
    assert_eq!(second.health.slaves_found, 1);

    orchestrator.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn fault_events_carry_code_and_hint() {
    let (orchestrator, controls) = ready_orchestrator(1).await;
    let mut faults = orchestrator.faulted().unwrap();
    controls.force_status(pzm_common::DriveStatus::ENCODER_ERROR);

    let event = tokio::time::timeout(Duration::from_secs(2), faults.recv())
        .await
        .expect("fault within two seconds")
        .unwrap();
    assert_eq!(event.slave, 1);
    assert_eq!(event.error.code, DriveErrorCode::EncoderError);
    assert!(!event.error.hint.is_empty());

    orchestrator.shutdown().await.unwrap();
}
