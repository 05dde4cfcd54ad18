//! # PZM Orchestrator Demo
//!
//! Runs the drive orchestrator against the simulated bus adapter:
//! enables an axis, moves it to a target position, and dumps the final
//! status snapshot. Useful for eyeballing loop behavior and log output
//! without hardware.

use clap::Parser;
use pzm_common::OrchestratorOptions;
use pzm_hal::SimAdapter;
use pzm_orchestrator::DriveOrchestrator;
use std::process;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "pzm_orchestrator")]
#[command(about = "PZM drive orchestrator demo on the simulated bus")]
#[command(version)]
struct Args {
    /// Bus interface name (informational for the simulated adapter).
    #[arg(long, default_value = "sim0")]
    interface: String,

    /// Number of simulated drives.
    #[arg(long, default_value_t = 4)]
    slaves: usize,

    /// Axis to exercise (1-based).
    #[arg(long, default_value_t = 1)]
    slave: u16,

    /// Target position for the demo move.
    #[arg(long, default_value_t = 50_000)]
    target: i32,

    /// I/O loop cycle period in microseconds.
    #[arg(long, default_value_t = 2_000)]
    cycle_us: u32,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let options = OrchestratorOptions {
        cycle_period_us: args.cycle_us,
        ..OrchestratorOptions::default()
    };
    if let Err(e) = options.validate() {
        error!("invalid options: {e}");
        process::exit(1);
    }

    let orchestrator = DriveOrchestrator::new(Box::new(SimAdapter::new(args.slaves)), options);
    if let Err(e) = orchestrator.initialize(&args.interface).await {
        error!("initialization failed: {e}");
        process::exit(1);
    }
    info!(
        slaves = orchestrator.slave_count().unwrap_or(0),
        "bus up; enabling axis {}",
        args.slave
    );

    if let Err(e) = orchestrator.enable(args.slave, true).await {
        error!("enable failed: {e}");
        let _ = orchestrator.shutdown().await;
        process::exit(1);
    }

    info!("searching encoder index on axis {}", args.slave);
    if let Err(e) = orchestrator.index(args.slave, 0, 10_000, 1_000, 1_000, None).await {
        error!("index search failed: {e}");
        let _ = orchestrator.shutdown().await;
        process::exit(1);
    }

    info!(target = args.target, "moving axis {}", args.slave);
    match orchestrator
        .move_absolute(args.slave, args.target, 30_000, 1_000, 1_000, None)
        .await
    {
        Ok(()) => {
            if let Ok(snapshot) = orchestrator.get_status() {
                let axis = &snapshot.drive_states[usize::from(args.slave) - 1];
                info!(
                    position = axis.actual_position,
                    cycle_us = snapshot.cycle_time.as_micros() as u64,
                    max_cycle_us = snapshot.max_cycle.as_micros() as u64,
                    "move complete"
                );
            }
        }
        Err(e) => error!("move failed: {e}"),
    }

    if let Err(e) = orchestrator.shutdown().await {
        error!("shutdown failed: {e}");
        process::exit(1);
    }
    info!("demo finished");
}
