mod common;

use chrono::Duration as ChronoDuration;
use common::*;
use fleet_shared::{DriverRef, JobStatus};
use fleet_shared::api_models::StartJobRequest;
use fleet_shared::protocol::{AgentException, ControlAction, ExceptionSeverity};
use printfleet::FleetError;
use std::sync::Arc;

fn start(index: usize, gcode_ref: &str) -> StartJobRequest {
    StartJobRequest {
        printer_ref: printer(index),
        gcode_ref: gcode_ref.to_string(),
        start_offset_line: None,
    }
}

#[tokio::test]
async fn jobs_on_several_printers_stream_every_line_once() {
    let rig = rig(test_config(), 3, Arc::new(InstantEngine)).await;
    rig.gcode.insert("cube.gcode", &program(150)).await;

    let mut ids = Vec::new();
    for i in 0..3 {
        ids.push(rig.host.lifecycle.start_job(start(i, "cube.gcode")).await.unwrap().id);
    }
    for (i, id) in ids.into_iter().enumerate() {
        let done = wait_for_status(&rig, id, JobStatus::Completed).await;
        assert_eq!(done.progress_lines, 150);
        let log = rig.fleet.driver(&printer(i)).unwrap().log();
        assert_eq!(log.lines, common::program(150).lines().map(str::to_string).collect::<Vec<_>>());
        assert_eq!(log.controls[0].action, ControlAction::Start);
        assert!(rig.host.lifecycle.active_job_for(&printer(i)).is_none());
    }
}

#[tokio::test]
async fn duplicated_responses_do_not_skip_or_repeat_lines() {
    let rig = rig(test_config(), 1, Arc::new(InstantEngine)).await;
    rig.gcode.insert("cube.gcode", &program(80)).await;
    let driver = rig.fleet.driver(&printer(0)).unwrap();
    driver.duplicate_responses(true);

    let id = rig.host.lifecycle.start_job(start(0, "cube.gcode")).await.unwrap().id;
    let done = wait_for_status(&rig, id, JobStatus::Completed).await;
    assert_eq!(done.progress_lines, 80);
    assert_eq!(driver.executed_lines(), 80);
}

#[tokio::test]
async fn dropped_response_is_recovered_by_retry() {
    let rig = rig(test_config(), 1, Arc::new(InstantEngine)).await;
    rig.gcode.insert("cube.gcode", &program(20)).await;
    let driver = rig.fleet.driver(&printer(0)).unwrap();

    let id = rig.host.lifecycle.start_job(start(0, "cube.gcode")).await.unwrap().id;
    wait_for_job(&rig, id, "some progress", |v| v.progress_lines >= 5).await;
    driver.drop_next_responses(1);

    let done = wait_for_status(&rig, id, JobStatus::Completed).await;
    assert_eq!(done.progress_lines, 20);
    assert_eq!(driver.executed_lines(), 20);
    assert_eq!(driver.log().redeliveries, 1);
}

#[tokio::test]
async fn paused_job_resumes_from_its_offset() {
    let mut config = test_config();
    config.dispatcher.max_retries = 0;
    let rig = rig(config, 1, Arc::new(InstantEngine)).await;
    rig.gcode.insert("vase.gcode", &program(500)).await;
    let driver = rig.fleet.driver(&printer(0)).unwrap();
    driver.stall_lines_after(Some(120));

    let id = rig.host.lifecycle.start_job(start(0, "vase.gcode")).await.unwrap().id;
    wait_for_job(&rig, id, "120 lines", |v| v.progress_lines == 120).await;
    let paused = rig.host.lifecycle.pause(id).await.unwrap();
    assert_eq!(paused.status, JobStatus::Paused);
    assert_eq!(paused.start_offset_line, 120);

    // The stalled line has to give up before the printer sees anything else.
    let dispatcher = rig.host.dispatcher.clone();
    wait_until("driver queue to drain", || {
        let dispatcher = dispatcher.clone();
        async move {
            let snap = dispatcher.snapshot(&printer(0)).await.unwrap();
            snap.in_flight.is_none() && snap.queued.is_empty()
        }
    })
    .await;
    driver.stall_lines_after(None);

    let resumed = rig.host.lifecycle.resume(id).await.unwrap();
    assert_eq!(resumed.status, JobStatus::Running);
    assert_eq!(resumed.start_offset_line, 120);

    let done = wait_for_status(&rig, id, JobStatus::Completed).await;
    assert_eq!(done.progress_lines, 500);
    let log = driver.log();
    assert_eq!(log.lines.len(), 500);
    assert_eq!(log.lines[120], "G1 X120 F1200");
    let restart = log
        .controls
        .iter()
        .filter(|c| c.action == ControlAction::Start)
        .last()
        .unwrap();
    assert_eq!(restart.resume_offset, Some(120));
}

#[tokio::test]
async fn missed_heartbeats_pause_and_keep_progress() {
    let mut config = test_config();
    config.dispatcher.command_timeout_ms = 10_000;
    let rig = rig(config, 1, Arc::new(InstantEngine)).await;
    rig.gcode.insert("cube.gcode", &program(200)).await;
    let driver = rig.fleet.driver(&printer(0)).unwrap();
    driver.stall_lines_after(Some(50));

    let id = rig.host.lifecycle.start_job(start(0, "cube.gcode")).await.unwrap().id;
    wait_for_job(&rig, id, "50 lines", |v| v.progress_lines == 50).await;
    driver.set_silent(true);
    rig.clock.advance(ChronoDuration::seconds(6));

    let paused = wait_for_status(&rig, id, JobStatus::Paused).await;
    assert_eq!(paused.progress_lines, 50);
    assert_eq!(paused.start_offset_line, 50);
    assert!(!rig.host.registry.is_alive(&printer(0)).await);

    // Back online, but without auto-resume the job waits for an operator.
    driver.set_silent(false);
    let registry = rig.host.registry.clone();
    wait_until("driver back online", || {
        let registry = registry.clone();
        async move { registry.is_alive(&printer(0)).await }
    })
    .await;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(rig.host.lifecycle.get(id).await.unwrap().status, JobStatus::Paused);
}

#[tokio::test]
async fn reconnect_resumes_when_configured() {
    let mut config = test_config();
    config.dispatcher.max_retries = 0;
    config.lifecycle.auto_resume_on_reconnect = true;
    let rig = rig(config, 1, Arc::new(InstantEngine)).await;
    rig.gcode.insert("cube.gcode", &program(300)).await;
    let driver = rig.fleet.driver(&printer(0)).unwrap();
    driver.stall_lines_after(Some(40));

    let id = rig.host.lifecycle.start_job(start(0, "cube.gcode")).await.unwrap().id;
    wait_for_job(&rig, id, "40 lines", |v| v.progress_lines == 40).await;
    driver.set_silent(true);
    rig.clock.advance(ChronoDuration::seconds(6));
    wait_for_status(&rig, id, JobStatus::Paused).await;

    driver.stall_lines_after(None);
    driver.set_silent(false);
    let done = wait_for_status(&rig, id, JobStatus::Completed).await;
    assert_eq!(done.progress_lines, 300);
    assert_eq!(driver.executed_lines(), 300);
}

#[tokio::test]
async fn recoverable_fault_pauses_and_fatal_fault_fails() {
    let mut config = test_config();
    config.check.every_commands = Some(5);
    let rig = rig(config, 2, Arc::new(InstantEngine)).await;
    rig.gcode.insert("cube.gcode", &program(2000)).await;

    let first = rig.host.lifecycle.start_job(start(0, "cube.gcode")).await.unwrap().id;
    wait_for_job(&rig, first, "first lines", |v| v.progress_lines >= 10).await;
    rig.fleet.driver(&printer(0)).unwrap().inject_exception(AgentException {
        code: "FILAMENT_OUT".into(),
        message: "runout sensor".into(),
        severity: ExceptionSeverity::Recoverable,
    });
    let paused = wait_for_status(&rig, first, JobStatus::Paused).await;
    assert!(paused.telemetry.is_some());

    let second = rig.host.lifecycle.start_job(start(1, "cube.gcode")).await.unwrap().id;
    wait_for_job(&rig, second, "first lines", |v| v.progress_lines >= 10).await;
    rig.fleet.driver(&printer(1)).unwrap().inject_exception(AgentException {
        code: "THERMAL_RUNAWAY".into(),
        message: "hotend".into(),
        severity: ExceptionSeverity::Fatal,
    });
    let failed = wait_for_status(&rig, second, JobStatus::Failed).await;
    assert_eq!(failed.error_message.as_deref(), Some("THERMAL_RUNAWAY: hotend"));

    let alerts = rig.alerts.alerts();
    let raised = |driver: DriverRef, code: &str| {
        alerts.iter().any(|a| a.driver == driver && a.exceptions[0].code == code)
    };
    assert!(raised(printer(0), "FILAMENT_OUT"));
    assert!(raised(printer(1), "THERMAL_RUNAWAY"));
}

#[tokio::test]
async fn silent_printer_refuses_new_jobs() {
    let rig = rig(test_config(), 1, Arc::new(InstantEngine)).await;
    rig.gcode.insert("cube.gcode", &program(10)).await;
    rig.fleet.driver(&printer(0)).unwrap().set_silent(true);
    rig.clock.advance(ChronoDuration::seconds(6));

    let err = rig.host.lifecycle.start_job(start(0, "cube.gcode")).await.unwrap_err();
    assert!(matches!(err, FleetError::DriverUnavailable(_)));
    assert!(rig.host.lifecycle.list().await.is_empty());
}
