//! Common test utilities for rust_tsp integration tests
//!
//! - session setup against the simulated instrument
//! - command log queries
//! - timing assertions with explicit tolerances

#![allow(dead_code)] // Not every test binary uses every helper

use rust_tsp::config::SessionConfig;
use rust_tsp::session::{CommandSet, TspSession};
use rust_tsp::transport::SimulatedInstrument;
use std::time::Duration;

/// Tolerance levels for timing assertions.
#[derive(Debug, Clone, Copy)]
pub enum TimingTolerance {
    /// Exact match - only for simulated time with `start_paused = true`
    Exact,
    /// 20% tolerance
    Normal,
    /// 50% tolerance - for real sockets under CI load
    Relaxed,
}

impl TimingTolerance {
    pub fn factor(&self) -> f64 {
        match self {
            TimingTolerance::Exact => 0.0,
            TimingTolerance::Normal => 0.20,
            TimingTolerance::Relaxed => 0.50,
        }
    }
}

/// Assert that a duration is within tolerance of an expected value.
pub fn assert_duration_near(
    actual: Duration,
    expected: Duration,
    tolerance: TimingTolerance,
    context: &str,
) {
    let factor = tolerance.factor();
    let min = expected.mul_f64(1.0 - factor);
    let max = expected.mul_f64(1.0 + factor);
    assert!(
        actual >= min && actual <= max,
        "{}: expected {:?} ±{:.0}%, got {:?}",
        context,
        expected,
        factor * 100.0,
        actual
    );
}

/// Session settings used by the simulated tests.
pub fn sim_config() -> SessionConfig {
    SessionConfig::for_resource("sim://bench")
}

/// Connect a session to `sim` with default commands and settings.
pub async fn connect(sim: &SimulatedInstrument) -> TspSession {
    connect_with(sim, sim_config(), CommandSet::default()).await
}

/// Connect with explicit settings; the command log is cleared afterwards.
pub async fn connect_with(
    sim: &SimulatedInstrument,
    config: SessionConfig,
    commands: CommandSet,
) -> TspSession {
    let session = TspSession::connect(Box::new(sim.clone()), config, commands)
        .await
        .expect("connect to simulated instrument");
    sim.clear_log();
    session
}

/// Logged commands containing `needle`, in order.
pub fn commands_containing(sim: &SimulatedInstrument, needle: &str) -> Vec<String> {
    sim.commands()
        .into_iter()
        .filter(|c| c.contains(needle))
        .collect()
}

/// Index of the first logged command equal to `command`.
pub fn position(log: &[String], command: &str) -> usize {
    log.iter()
        .position(|c| c == command)
        .unwrap_or_else(|| panic!("command '{command}' not sent; log: {log:#?}"))
}

/// The command sent right after `command`.
pub fn next_after(log: &[String], command: &str) -> String {
    log[position(log, command) + 1].clone()
}
