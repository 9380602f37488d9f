//! Error queue drains, clear semantics and register reads.

mod common;

use common::{commands_containing, connect, connect_with, sim_config};
use rust_tsp::config::SessionConfig;
use rust_tsp::registers::EventRegister;
use rust_tsp::session::{CommandSet, ErrorLevel, TspSession};
use rust_tsp::transport::SimulatedInstrument;
use rust_tsp::TspError;
use tracing_test::traced_test;

#[tokio::test(start_paused = true)]
async fn clean_drain_yields_empty_queue() {
    let sim = SimulatedInstrument::new();
    let session = connect(&sim).await;

    let queue = session.drain_error_queue().await.unwrap();

    assert!(queue.is_empty());
    assert!(!queue.has_device_error());
    assert!(!queue.exhausted());
    assert_eq!(commands_containing(&sim, "errorqueue.next()").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn drain_collects_one_error_then_stops_at_sentinel() {
    let sim = SimulatedInstrument::new();
    let session = connect(&sim).await;
    sim.push_error(-113, "undefined header");

    let queue = session.drain_error_queue().await.unwrap();

    assert_eq!(queue.len(), 1);
    let error = &queue.errors()[0];
    assert_eq!(error.number, -113);
    assert_eq!(error.message, "undefined header");
    assert_eq!(error.level, ErrorLevel::Error);
    assert!(!queue.has_device_error());
    assert!(queue.last_error().is_no_error());
    assert_eq!(sim.pending_errors(), 0);
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn drain_stops_on_iteration_budget() {
    let sim = SimulatedInstrument::new();
    let config = SessionConfig {
        error_drain_max_iterations: 3,
        ..sim_config()
    };
    let session = connect_with(&sim, config, CommandSet::default()).await;
    for n in 0..10 {
        sim.push_error(-200 - n, "execution error");
    }

    let queue = session.drain_error_queue().await.unwrap();

    assert_eq!(queue.len(), 3);
    assert!(queue.exhausted());
    assert!(queue.has_device_error());
    assert_eq!(sim.pending_errors(), 7);
    assert!(logs_contain("stopped on its budget"));
}

#[tokio::test(start_paused = true)]
async fn drain_if_error_available_skips_query_on_clean_status() {
    let sim = SimulatedInstrument::new();
    let session = connect(&sim).await;

    let queue = session.drain_if_error_available().await.unwrap();

    assert!(queue.is_empty());
    assert!(commands_containing(&sim, "errorqueue").is_empty());
}

#[tokio::test(start_paused = true)]
async fn informational_entries_do_not_throw() {
    let sim = SimulatedInstrument::new();
    let session = connect(&sim).await;
    sim.push_error_with_severity(5001, "buffer nearly full", 0);

    let queue = session.drain_error_queue().await.unwrap();

    assert_eq!(queue.errors()[0].level, ErrorLevel::Info);
    assert!(queue.throw_if_error("measure").is_ok());
}

#[tokio::test(start_paused = true)]
async fn clear_reapplies_enable_masks() {
    let sim = SimulatedInstrument::new();
    let session = connect(&sim).await;
    session.enable_service_request(0x04).await.unwrap();
    session.enable_standard_events(0x3C).await.unwrap();

    session.clear_execution_state().await.unwrap();

    assert_eq!(sim.service_request_enable(), 0x04);
    assert_eq!(sim.standard_event_enable(), 0x3C);
    assert!(session.last_device_errors().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn clear_leaves_enables_alone_when_instrument_preserves_them() {
    let sim = SimulatedInstrument::new().with_clear_preserving_enables();
    let commands = CommandSet {
        clear_preserves_enables: true,
        ..CommandSet::default()
    };
    let session = connect_with(&sim, sim_config(), commands).await;
    session.enable_service_request(0x04).await.unwrap();
    sim.clear_log();

    session.clear_execution_state().await.unwrap();

    assert_eq!(sim.commands(), vec!["*CLS".to_string()]);
    assert_eq!(sim.service_request_enable(), 0x04);
}

#[tokio::test(start_paused = true)]
async fn error_available_requests_service_when_enabled() {
    let sim = SimulatedInstrument::new();
    let session = connect(&sim).await;
    session.enable_service_request(0x04).await.unwrap();
    sim.push_error(-222, "data out of range");

    let status = session.read_status_byte().await.unwrap();

    assert!(status.error_available());
    assert!(status.requesting_service());
    assert_eq!(status.to_string(), "0x44 [EAV,RQS]");
}

#[tokio::test(start_paused = true)]
async fn event_register_read_clears_and_decodes() {
    let sim = SimulatedInstrument::new();
    let session = connect(&sim).await;
    sim.push_error(-113, "undefined header");

    let value = session
        .read_event_register(EventRegister::Standard)
        .await
        .unwrap();
    assert_eq!(value, 0x20);
    let registers = session.registers().await;
    assert_eq!(registers.event_status(EventRegister::Standard), 0x20);
    assert_eq!(
        registers.describe_event(EventRegister::Standard, value),
        vec!["CME"]
    );

    let again = session
        .read_event_register(EventRegister::Standard)
        .await
        .unwrap();
    assert_eq!(again, 0);
}

#[tokio::test(start_paused = true)]
async fn reset_known_state_returns_clean_queue() {
    let sim = SimulatedInstrument::new();
    let session = connect(&sim).await;
    sim.push_error(-113, "undefined header");

    let queue = session.reset_known_state().await.unwrap();

    assert!(queue.is_empty());
    assert_eq!(commands_containing(&sim, "*RST"), vec!["*RST".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn connect_resolves_firmware_rules() {
    let sim = SimulatedInstrument::new().with_firmware("2.1.7b");
    let session = connect(&sim).await;

    assert_eq!(session.firmware().to_string(), "2.1.7");
    assert_eq!(session.rules(), rust_tsp::session::FirmwareRules::Legacy);
    assert_eq!(sim.opened_with().0.as_deref(), Some("sim://bench"));
}

#[tokio::test(start_paused = true)]
async fn failed_initialization_closes_transport() {
    let sim = SimulatedInstrument::new().with_firmware("unknown");

    let result =
        TspSession::connect(Box::new(sim.clone()), sim_config(), CommandSet::default()).await;

    assert!(matches!(result, Err(TspError::Protocol(_))));
    assert!(!rust_tsp::transport::Transport::is_open(&sim));
}

#[tokio::test(start_paused = true)]
async fn scoped_session_closes_on_error() {
    let sim = SimulatedInstrument::new();

    let result: rust_tsp::TspResult<()> = TspSession::scoped(
        Box::new(sim.clone()),
        sim_config(),
        CommandSet::default(),
        |session| async move {
            session.write("bogus(").await?;
            session
                .confirm_completion(
                    session.controller(),
                    "bogus",
                    std::time::Duration::from_secs(1),
                )
                .await
        },
    )
    .await;

    assert!(matches!(result, Err(TspError::Device { .. })));
    assert!(!rust_tsp::transport::Transport::is_open(&sim));
}

#[tokio::test(start_paused = true)]
async fn transport_failure_is_not_retried() {
    let sim = SimulatedInstrument::new();
    let session = connect(&sim).await;
    sim.inject_next_failure();

    let err = session.identity().await.unwrap_err();

    assert!(matches!(err, TspError::Transport(_)));
    assert!(!err.is_invariant_violation());
    assert!(session.identity().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn oversized_command_is_rejected_before_writing() {
    let sim = SimulatedInstrument::new().with_max_message_length(80);
    let session = connect(&sim).await;
    let command = format!("_G.print('{}')", "x".repeat(80));

    let err = session.write(&command).await.unwrap_err();

    assert!(matches!(err, TspError::InvalidOperation(_)));
    assert!(sim.commands().is_empty());
}

#[tokio::test(start_paused = true)]
async fn connect_without_clear_keeps_queued_errors() {
    let sim = SimulatedInstrument::new();
    sim.push_error(-113, "undefined header");
    let config = SessionConfig {
        clear_on_connect: false,
        ..sim_config()
    };

    let session = TspSession::connect(Box::new(sim.clone()), config, CommandSet::default())
        .await
        .unwrap();
    assert!(commands_containing(&sim, "*CLS").is_empty());

    let queue = session.drain_error_queue().await.unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.errors()[0].number, -113);
}
