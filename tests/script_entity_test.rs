//! Script entity lifecycle against the simulated instrument.

mod common;

use common::{commands_containing, connect, position};
use rust_tsp::script::{fetch_catalog, ScriptEntity, ScriptEntityCollection, ScriptInfo, ScriptStage};
use rust_tsp::transport::{SimValue, SimulatedInstrument};
use rust_tsp::{TspError, TspSession};
use tracing_test::traced_test;

const STATION: &str = "station = {}\nstation.ready = 1";

fn boot_me() -> ScriptInfo {
    ScriptInfo::new("boot_me", STATION).with_namespaces(["station"])
}

async fn loaded(session: &TspSession, info: ScriptInfo, node: u32) -> ScriptEntity {
    let mut entity = ScriptEntity::new(info, session.node(node));
    entity.load(session).await.unwrap();
    entity
}

#[tokio::test(start_paused = true)]
async fn load_defines_script_on_controller() {
    let sim = SimulatedInstrument::new();
    let session = connect(&sim).await;

    let entity = loaded(&session, boot_me(), 1).await;

    assert!(entity.is_loaded());
    assert!(!entity.is_activated());
    let log = sim.commands();
    assert_eq!(log[0], "loadscript boot_me");
    assert_eq!(log[position(&log, "endscript") - 1], "station.ready = 1");
    assert_eq!(sim.script(1, "boot_me").unwrap().body, STATION);
}

#[tokio::test(start_paused = true)]
async fn load_on_remote_node_goes_through_staging_copy() {
    let sim = SimulatedInstrument::new().with_node(2);
    let session = connect(&sim).await;

    let entity = loaded(&session, boot_me(), 2).await;

    assert!(entity.is_loaded());
    assert_eq!(sim.script(2, "boot_me").unwrap().body, STATION);
    assert!(sim.script(1, "boot_me").is_none());
    assert!(!sim.is_defined(1, "boot_me_stage"));
    assert_eq!(commands_containing(&sim, "loadscript boot_me_stage").len(), 1);
    assert_eq!(commands_containing(&sim, "_G.boot_me_stage=nil").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn legacy_firmware_converts_by_nulling_source() {
    let sim = SimulatedInstrument::new().with_firmware("2.1.7");
    let session = connect(&sim).await;
    let mut entity = loaded(&session, boot_me(), 1).await;

    entity.convert_to_byte_code(&session).await.unwrap();

    assert!(entity.is_byte_code());
    assert!(sim.script(1, "boot_me").unwrap().byte_code);
    assert_eq!(commands_containing(&sim, "boot_me.source=nil").len(), 1);
    assert!(commands_containing(&sim, "compile(").is_empty());
}

#[tokio::test(start_paused = true)]
async fn compiled_firmware_uses_helper() {
    let sim = SimulatedInstrument::new();
    let session = connect(&sim).await;
    sim.define_global(1, "tsp_support.compile", SimValue::Function);
    let mut entity = loaded(&session, boot_me(), 1).await;

    entity.convert_to_byte_code(&session).await.unwrap();

    assert!(entity.is_byte_code());
    assert_eq!(
        commands_containing(&sim, "compile("),
        vec!["_G.tsp_support.compile(boot_me)".to_string()]
    );
    assert!(commands_containing(&sim, "source=nil").is_empty());
}

#[tokio::test(start_paused = true)]
async fn compiled_firmware_without_helper_sends_nothing() {
    let sim = SimulatedInstrument::new();
    let session = connect(&sim).await;
    let mut entity = loaded(&session, boot_me(), 1).await;
    sim.clear_log();

    let err = entity.convert_to_byte_code(&session).await.unwrap_err();

    assert!(matches!(err, TspError::InvalidOperation(_)));
    assert!(!entity.is_byte_code());
    assert!(commands_containing(&sim, "compile(").is_empty());
    assert!(commands_containing(&sim, "source=nil").is_empty());
}

#[tokio::test(start_paused = true)]
async fn convert_requires_loaded_script() {
    let sim = SimulatedInstrument::new();
    let session = connect(&sim).await;
    let mut entity = ScriptEntity::new(boot_me(), session.controller());

    let err = entity.convert_to_byte_code(&session).await.unwrap_err();
    assert!(matches!(err, TspError::InvalidOperation(_)));
    assert!(sim.commands().is_empty());
}

#[tokio::test(start_paused = true)]
async fn run_activates_through_namespaces() {
    let sim = SimulatedInstrument::new();
    let session = connect(&sim).await;
    let mut entity = loaded(&session, boot_me(), 1).await;

    entity.run(&session, false).await.unwrap();

    assert!(entity.is_activated());
    assert!(entity.last_failure().is_none());
    assert!(sim.is_defined(1, "station.ready"));
}

#[tokio::test(start_paused = true)]
async fn run_is_skipped_when_active_unless_forced() {
    let sim = SimulatedInstrument::new();
    let session = connect(&sim).await;
    let mut entity = loaded(&session, boot_me(), 1).await;
    entity.run(&session, false).await.unwrap();
    sim.clear_log();

    entity.run(&session, false).await.unwrap();
    assert!(commands_containing(&sim, "boot_me.run()").is_empty());

    entity.run(&session, true).await.unwrap();
    assert_eq!(commands_containing(&sim, "boot_me.run()").len(), 1);
    assert!(entity.is_activated());
}

#[tokio::test(start_paused = true)]
async fn run_failure_is_recorded_not_returned() {
    let sim = SimulatedInstrument::new();
    let session = connect(&sim).await;
    let info = ScriptInfo::new("broken", "error('boom')").with_namespaces(["broken_ns"]);
    let mut entity = loaded(&session, info, 1).await;

    entity.run(&session, false).await.unwrap();

    assert!(!entity.is_activated());
    assert!(!entity.is_embedded());
    let failure = entity.last_failure().unwrap();
    assert_eq!(failure.stage, ScriptStage::Run);
    assert!(failure.detail.contains("boom"), "detail: {}", failure.detail);
}

#[tokio::test(start_paused = true)]
async fn run_with_garbled_handshake_clears_flags() {
    let sim = SimulatedInstrument::new();
    let session = connect(&sim).await;
    let mut entity = loaded(&session, boot_me(), 1).await;
    entity.run(&session, false).await.unwrap();
    entity.save(&session).await.unwrap();
    assert!(entity.is_activated() && entity.is_embedded());
    sim.push_reply("garbage");

    let err = entity.run(&session, true).await.unwrap_err();

    assert!(matches!(err, TspError::Protocol(_)), "got {err:?}");
    assert!(!entity.is_activated());
    assert!(!entity.is_embedded());
    let failure = entity.last_failure().unwrap();
    assert_eq!(failure.stage, ScriptStage::Run);
    assert!(failure.detail.contains("garbage"), "detail: {}", failure.detail);
}

#[tokio::test(start_paused = true)]
async fn boot_save_marks_autorun_and_records_firmware() {
    let sim = SimulatedInstrument::new();
    let session = connect(&sim).await;
    let mut entity = loaded(&session, boot_me().boot(), 1).await;
    entity.run(&session, false).await.unwrap();

    entity.save(&session).await.unwrap();

    let log = sim.commands();
    assert!(position(&log, "boot_me.autorun='yes'") < position(&log, "boot_me.save()"));
    assert!(entity.is_embedded());
    assert_eq!(entity.embedded_firmware_version(), Some("3.0.2"));
    assert!(sim.script(1, "boot_me").unwrap().autorun);
    assert_eq!(sim.saved_scripts(1), vec!["boot_me".to_string()]);
    assert_eq!(
        fetch_catalog(&session, session.controller()).await.unwrap(),
        vec!["boot_me".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn non_boot_save_skips_autorun() {
    let sim = SimulatedInstrument::new();
    let session = connect(&sim).await;
    let mut entity = loaded(&session, boot_me(), 1).await;

    entity.save(&session).await.unwrap();

    assert!(commands_containing(&sim, "autorun").is_empty());
    assert!(!sim.script(1, "boot_me").unwrap().autorun);
}

#[tokio::test(start_paused = true)]
async fn delete_all_runs_in_reverse_order() {
    let sim = SimulatedInstrument::new();
    let session = connect(&sim).await;
    let mut collection = ScriptEntityCollection::new(session.controller());
    for name in ["a", "b", "c"] {
        let info = ScriptInfo::new(name, format!("{name}_ns = 1"));
        let mut entity = loaded(&session, info, 1).await;
        entity.save(&session).await.unwrap();
        collection.push(entity).unwrap();
    }
    sim.clear_log();

    collection.delete_all(&session).await.unwrap();

    assert_eq!(
        commands_containing(&sim, "script.delete("),
        vec![
            "_G.script.delete('c')".to_string(),
            "_G.script.delete('b')".to_string(),
            "_G.script.delete('a')".to_string(),
        ]
    );
    assert!(sim.saved_scripts(1).is_empty());
    assert!(collection.iter().all(|e| !e.is_loaded() && !e.is_embedded()));
}

#[tokio::test(start_paused = true)]
async fn collection_rejects_duplicates_and_foreign_nodes() {
    let sim = SimulatedInstrument::new().with_node(2);
    let session = connect(&sim).await;
    let mut collection = ScriptEntityCollection::new(session.controller());

    collection
        .push(ScriptEntity::new(boot_me(), session.controller()))
        .unwrap();
    let duplicate = collection.push(ScriptEntity::new(boot_me(), session.controller()));
    let foreign = collection.push(ScriptEntity::new(boot_me(), session.node(2)));

    assert!(matches!(duplicate, Err(TspError::InvalidOperation(_))));
    assert!(matches!(foreign, Err(TspError::InvalidOperation(_))));
    assert_eq!(collection.len(), 1);
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn delete_warns_about_residual_errors() {
    let sim = SimulatedInstrument::new();
    let session = connect(&sim).await;
    let mut entity = loaded(&session, boot_me(), 1).await;
    sim.push_error(-222, "data out of range");

    entity.delete(&session).await.unwrap();

    assert!(!entity.is_loaded());
    assert!(sim.script(1, "boot_me").is_none());
    assert!(logs_contain("Errors left after delete"));
}

#[tokio::test(start_paused = true)]
async fn power_cycle_leaves_saved_script_loaded_but_inactive() {
    let sim = SimulatedInstrument::new();
    let session = connect(&sim).await;
    let mut entity = loaded(&session, boot_me(), 1).await;
    entity.run(&session, false).await.unwrap();
    entity.save(&session).await.unwrap();

    sim.power_cycle();
    entity.refresh(&session).await.unwrap();

    assert!(entity.is_loaded());
    assert!(entity.is_embedded());
    assert!(!entity.is_activated());
}

#[tokio::test(start_paused = true)]
async fn deployed_version_reads_getter() {
    let sim = SimulatedInstrument::new();
    let session = connect(&sim).await;
    let info = ScriptInfo::new("lib_script", "lib = {}\nlib.version = \"1.2.0\"")
        .with_namespaces(["lib"])
        .with_version("1.2.0", "lib.version");
    let mut entity = loaded(&session, info, 1).await;

    assert_eq!(entity.deployed_version(&session).await.unwrap(), None);
    entity.run(&session, false).await.unwrap();
    assert_eq!(
        entity.deployed_version(&session).await.unwrap().as_deref(),
        Some("1.2.0")
    );
}
