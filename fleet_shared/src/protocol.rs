//! Messages exchanged between the fleet host and printer driver agents.
//!
//! Every request/response pair is correlated by ids carried in the message
//! itself (`request_id` for commands, `job_ref`/`driver` for checks), so the
//! transport underneath is free to redeliver.

use serde::{Deserialize, Serialize};

use crate::ids::{DriverRef, JobId, RequestId};

/// Priority used for streamed G-code lines.
pub const PRIORITY_STREAM: u8 = 5;
/// Priority used for start/pause/resume control requests.
pub const PRIORITY_CONTROL: u8 = 8;
/// Priority used for stop requests; overtakes everything still queued.
pub const PRIORITY_STOP: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Online,
    Busy,
    Error,
}

/// Periodic liveness signal from a driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub driver: DriverRef,
    pub status: AgentStatus,
}

/// Check trigger criteria. Both triggers are independent; whichever fires
/// first issues the check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CheckCriteria {
    pub every_commands: Option<u32>,
    pub every_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckRequest {
    pub driver: DriverRef,
    pub criteria: CheckCriteria,
    pub job_ref: Option<JobId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionSeverity {
    Recoverable,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentException {
    pub code: String,
    pub message: String,
    pub severity: ExceptionSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AxisPositions {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub e: f64,
}

/// Full physical-state snapshot returned by a check.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Telemetry {
    pub axes: AxisPositions,
    pub feed_rate: f64,
    pub layer: u32,
    pub extruder_temp: f64,
    pub bed_temp: f64,
    pub fan_on: bool,
    pub fan_speed: f64,
    pub last_command_offset: u64,
    pub average_speed: f64,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub exceptions: Vec<AgentException>,
}

impl Telemetry {
    pub fn fatal_exceptions(&self) -> impl Iterator<Item = &AgentException> {
        self.exceptions
            .iter()
            .filter(|e| e.severity == ExceptionSeverity::Fatal)
    }

    pub fn recoverable_exceptions(&self) -> impl Iterator<Item = &AgentException> {
        self.exceptions
            .iter()
            .filter(|e| e.severity == ExceptionSeverity::Recoverable)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResponse {
    pub driver: DriverRef,
    pub job_ref: Option<JobId>,
    pub telemetry: Telemetry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Start,
    Pause,
    Stop,
}

/// Start/pause/stop request. A start carries either the full payload
/// reference or inline fragments, plus the line to resume from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub action: ControlAction,
    pub job_ref: Option<JobId>,
    pub gcode_ref: Option<String>,
    pub start_gcode: Option<String>,
    pub end_gcode: Option<String>,
    pub resume_offset: Option<u64>,
}

impl ControlRequest {
    pub fn start(job: JobId, gcode_ref: impl Into<String>, resume_offset: u64) -> Self {
        Self {
            action: ControlAction::Start,
            job_ref: Some(job),
            gcode_ref: Some(gcode_ref.into()),
            start_gcode: None,
            end_gcode: None,
            resume_offset: Some(resume_offset),
        }
    }

    pub fn pause(job: JobId) -> Self {
        Self::bare(ControlAction::Pause, job)
    }

    pub fn stop(job: JobId) -> Self {
        Self::bare(ControlAction::Stop, job)
    }

    fn bare(action: ControlAction, job: JobId) -> Self {
        Self {
            action,
            job_ref: Some(job),
            gcode_ref: None,
            start_gcode: None,
            end_gcode: None,
            resume_offset: None,
        }
    }
}

/// What a command carries: one G-code line or a control request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum CommandPayload {
    Line(String),
    Control(ControlRequest),
}

impl CommandPayload {
    pub fn topic(&self) -> &'static str {
        match self {
            CommandPayload::Line(_) => "command-request",
            CommandPayload::Control(_) => "control-request",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub driver: DriverRef,
    pub request_id: RequestId,
    pub payload: CommandPayload,
    pub priority: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub driver: DriverRef,
    pub request_id: RequestId,
    pub ok: bool,
    pub exception: Option<String>,
    pub info: Option<String>,
}

/// System → agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", rename_all = "kebab-case")]
pub enum Outbound {
    Command(CommandRequest),
    Check(CheckRequest),
}

impl Outbound {
    pub fn driver(&self) -> &DriverRef {
        match self {
            Outbound::Command(c) => &c.driver,
            Outbound::Check(c) => &c.driver,
        }
    }
}

/// Agent → system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", rename_all = "kebab-case")]
pub enum Inbound {
    Heartbeat(Heartbeat),
    CommandResponse(CommandResponse),
    CheckResponse(CheckResponse),
}

impl Inbound {
    pub fn driver(&self) -> &DriverRef {
        match self {
            Inbound::Heartbeat(h) => &h.driver,
            Inbound::CommandResponse(r) => &r.driver,
            Inbound::CheckResponse(r) => &r.driver,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_is_tagged_by_topic() {
        let msg = Outbound::Command(CommandRequest {
            driver: DriverRef::new("mk4-01"),
            request_id: RequestId(7),
            payload: CommandPayload::Line("G28".into()),
            priority: PRIORITY_STREAM,
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["topic"], "command");
        assert_eq!(json["request_id"], 7);
        assert_eq!(json["payload"]["kind"], "line");
        assert_eq!(json["payload"]["body"], "G28");
    }

    #[test]
    fn telemetry_classifies_exceptions() {
        let telemetry = Telemetry {
            exceptions: vec![
                AgentException {
                    code: "THERMAL_RUNAWAY".into(),
                    message: "hotend".into(),
                    severity: ExceptionSeverity::Fatal,
                },
                AgentException {
                    code: "FILAMENT_OUT".into(),
                    message: "runout sensor".into(),
                    severity: ExceptionSeverity::Recoverable,
                },
            ],
            ..Default::default()
        };
        assert_eq!(telemetry.fatal_exceptions().count(), 1);
        assert_eq!(telemetry.recoverable_exceptions().next().unwrap().code, "FILAMENT_OUT");
    }

    #[test]
    fn control_topic_differs_from_line_topic() {
        let start = CommandPayload::Control(ControlRequest::start(JobId::new(), "cube.gcode", 0));
        assert_eq!(start.topic(), "control-request");
        assert_eq!(CommandPayload::Line("M105".into()).topic(), "command-request");
    }
}
