mod common;

use std::io::Write;
use std::time::Duration;

use common::{test_config, Op, Probe, ScriptedConnector, BRING_UP};
use pipa_rig_lib::config::SerialSettings;
use pipa_rig_lib::rig::{Connector, EngineState, RigController, RigError, RigEvent, RunOutcome, StepKind};
use pipa_rig_lib::serial::{LineTransport, SerialError};

fn controller(probe: &Probe) -> RigController {
    RigController::with_connector(test_config(), Box::new(ScriptedConnector::new(probe.clone())))
}

struct MissingDevice;

#[async_trait::async_trait]
impl Connector for MissingDevice {
    async fn open(&self, _settings: &SerialSettings) -> Result<Box<dyn LineTransport>, RigError> {
        Err(SerialError::PortNotFound("no port matched".to_string()).into())
    }
}

#[tokio::test]
async fn test_connect_resets_then_brings_up() {
    let probe = Probe::new();
    let rig = controller(&probe);

    rig.connect().await.unwrap();
    assert!(rig.is_connected().await);
    assert_eq!(probe.ops().first(), Some(&Op::Reset));
    assert_eq!(probe.writes(), BRING_UP);
    assert_eq!(rig.state(), EngineState::Idle);
}

#[tokio::test]
async fn test_second_connect_is_rejected() {
    let probe = Probe::new();
    let rig = controller(&probe);

    rig.connect().await.unwrap();
    assert!(matches!(rig.connect().await, Err(RigError::AlreadyConnected)));
    assert_eq!(probe.resets(), 1);
}

#[tokio::test]
async fn test_failed_bring_up_keeps_link_for_reset() {
    let probe = Probe::new();
    let rig = RigController::with_connector(test_config(), Box::new(ScriptedConnector::silent_on(probe.clone(), "G28 Z")));

    assert!(matches!(rig.connect().await, Err(RigError::ProtocolTimeout { .. })));
    assert!(rig.is_connected().await);

    // Still silent, but reset reaches the controller again
    assert!(matches!(rig.reset().await, Err(RigError::ProtocolTimeout { .. })));
    assert_eq!(probe.resets(), 2);
}

#[tokio::test]
async fn test_discovery_failure_maps_to_discovery_error() {
    let rig = RigController::with_connector(test_config(), Box::new(MissingDevice));

    assert!(matches!(rig.connect().await, Err(RigError::Discovery(_))));
    assert!(!rig.is_connected().await);
}

#[tokio::test]
async fn test_operations_need_a_link() {
    let probe = Probe::new();
    let rig = controller(&probe);
    rig.add_step("Step 1", StepKind::Wash, "00:00:01").await.unwrap();

    assert!(matches!(rig.start(rig.steps().await).await, Err(RigError::LinkUnavailable)));
    assert!(matches!(rig.send_raw("G28").await, Err(RigError::LinkUnavailable)));
    assert!(rig.history().await.is_empty(), "unsent command must not reach history");
    assert!(matches!(rig.reset().await, Err(RigError::LinkUnavailable)));
    assert!(matches!(rig.em_stop().await, Err(RigError::LinkUnavailable)));
    assert!(matches!(rig.disconnect().await, Err(RigError::LinkUnavailable)));
}

#[tokio::test]
async fn test_add_step_rejects_malformed_duration() {
    let probe = Probe::new();
    let rig = controller(&probe);

    assert!(matches!(
        rig.add_step("Bad", StepKind::Home, "1:2").await,
        Err(RigError::MalformedDuration(_))
    ));
    assert!(matches!(
        rig.add_step("Bad", StepKind::Home, "00:75:00").await,
        Err(RigError::MalformedDuration(_))
    ));
    assert!(rig.steps().await.is_empty());

    let step = rig.add_step("Rinse", StepKind::Wash, "01:02:03").await.unwrap();
    assert_eq!(step.duration.as_secs(), 3723);
    assert_eq!(rig.steps().await.len(), 1);
}

#[tokio::test]
async fn test_send_raw_feeds_history() {
    let probe = Probe::new();
    let rig = controller(&probe);
    rig.connect().await.unwrap();

    assert_eq!(rig.send_raw("m114").await.unwrap(), vec!["ok"]);
    rig.send_raw("g28 x").await.unwrap();
    // Blank input is neither sent nor recorded
    assert!(rig.send_raw("   ").await.unwrap().is_empty());

    assert_eq!(rig.history().await, vec!["M114", "G28 X"]);
    assert_eq!(&probe.writes()[BRING_UP.len()..], &["M114", "G28 X"]);

    assert_eq!(rig.recall_previous().await.unwrap(), "G28 X");
    assert_eq!(rig.recall_previous().await.unwrap(), "M114");
    assert!(matches!(rig.recall_previous().await, Err(RigError::AtBoundary)));
    assert_eq!(rig.recall_next().await.unwrap(), "G28 X");
    assert_eq!(rig.recall_next().await.unwrap(), "");
    assert!(matches!(rig.recall_next().await, Err(RigError::AtBoundary)));
}

#[tokio::test(start_paused = true)]
async fn test_run_completes_and_reports() {
    let probe = Probe::new();
    let rig = controller(&probe);
    rig.connect().await.unwrap();
    rig.add_step("Step 1", StepKind::AddSolution, "00:00:10").await.unwrap();
    rig.add_step("Step 2", StepKind::Wash, "00:00:05").await.unwrap();

    let mut events = rig.subscribe_events();
    let run_id = rig.start(rig.steps().await).await.unwrap();
    assert_eq!(rig.join_run().await, Some(RunOutcome::Completed));

    let mut progress = Vec::new();
    let mut finished = None;
    while let Ok(event) = events.try_recv() {
        match event {
            RigEvent::Progress { percent } => progress.push(percent),
            RigEvent::RunFinished { run_id, outcome } => finished = Some((run_id, outcome)),
            _ => {}
        }
    }
    assert_eq!(progress, vec![50, 100]);
    assert_eq!(finished, Some((run_id, RunOutcome::Completed)));
    assert_eq!(rig.state(), EngineState::Idle);
}

#[tokio::test]
async fn test_busy_engine_refuses_ad_hoc_work() {
    let probe = Probe::new();
    let rig = controller(&probe);
    rig.connect().await.unwrap();
    rig.add_step("Long", StepKind::AddSolution, "00:10:00").await.unwrap();

    let mut events = rig.subscribe_events();
    rig.start(rig.steps().await).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(RigEvent::DwellStarted { .. }) = events.recv().await {
                break;
            }
        }
    })
    .await
    .expect("dwell should start");

    assert!(matches!(rig.send_raw("M114").await, Err(RigError::Busy(_))));
    assert!(matches!(rig.start(rig.steps().await).await, Err(RigError::Busy(_))));
    assert!(matches!(rig.clear_steps().await, Err(RigError::Busy(_))));

    let response = rig.em_stop().await.unwrap();
    assert_eq!(response, vec!["ok"]);
    let outcome = tokio::time::timeout(Duration::from_secs(1), rig.join_run())
        .await
        .expect("run should stop promptly");
    assert_eq!(outcome, Some(RunOutcome::Stopped));

    // Idle again: ad-hoc commands go through
    rig.send_raw("M114").await.unwrap();
    assert_eq!(probe.writes().last().map(String::as_str), Some("M114"));
}

#[tokio::test]
async fn test_load_source_file_and_replay() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "; calibration pass").unwrap();
    writeln!(file, "g28").unwrap();
    writeln!(file).unwrap();
    writeln!(file, "G0 X10 Y20 F3000 ; corner").unwrap();

    let probe = Probe::new();
    let rig = controller(&probe);
    rig.connect().await.unwrap();

    assert_eq!(rig.load_source_file(file.path()).await.unwrap(), 2);
    assert_eq!(rig.loaded_source().await, vec!["G28", "G0 X10 Y20 F3000"]);

    rig.replay().await.unwrap();
    assert_eq!(rig.join_run().await, Some(RunOutcome::Completed));
    assert_eq!(&probe.writes()[BRING_UP.len()..], &["G28", "G0 X10 Y20 F3000"]);
}

#[tokio::test]
async fn test_bad_source_keeps_previous_buffer() {
    let probe = Probe::new();
    let rig = controller(&probe);

    rig.load_steps_from_source(["G28", "M114"]).await.unwrap();
    assert!(matches!(
        rig.load_steps_from_source(["G28", "not gcode"]).await,
        Err(RigError::SourceFormat(_))
    ));
    assert_eq!(rig.loaded_source().await, vec!["G28", "M114"]);

    let missing = std::env::temp_dir().join("pipa-rig-missing-source.gcode");
    assert!(matches!(rig.load_source_file(&missing).await, Err(RigError::SourceFormat(_))));
}

#[tokio::test]
async fn test_replay_without_source_is_rejected() {
    let probe = Probe::new();
    let rig = controller(&probe);
    rig.connect().await.unwrap();

    assert!(matches!(rig.replay().await, Err(RigError::SourceFormat(_))));
}

#[tokio::test]
async fn test_disconnect_drops_link() {
    let probe = Probe::new();
    let rig = controller(&probe);
    rig.connect().await.unwrap();

    rig.disconnect().await.unwrap();
    assert!(!rig.is_connected().await);
    // A fresh connect is allowed again
    rig.connect().await.unwrap();
    assert_eq!(probe.resets(), 2);
}
