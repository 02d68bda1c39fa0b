//! One simulated printer driver: executes commands, answers checks, and
//! misbehaves on request.

use fleet_shared::protocol::{
    AgentException, AgentStatus, CheckRequest, CheckResponse, CommandPayload, CommandRequest,
    CommandResponse, ControlAction, ControlRequest, Heartbeat, Inbound, Telemetry,
};
use fleet_shared::{DriverRef, JobId, RequestId};
use std::sync::{Arc, Mutex, MutexGuard};

/// Misbehaviour switched on for one driver.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    /// No heartbeats and no responses of any kind.
    pub silent: bool,
    /// Number of upcoming command responses to swallow. The commands
    /// themselves still execute.
    pub drop_responses: u32,
    /// Send every command response twice.
    pub duplicate_responses: bool,
    /// Once this many lines have executed, further lines are rejected.
    pub reject_lines_after: Option<u64>,
    /// Once this many lines have executed, further lines are neither
    /// executed nor answered.
    pub stall_lines_after: Option<u64>,
    /// Reported, then cleared, by the next check response.
    pub exceptions: Vec<AgentException>,
}

/// Everything a driver has executed so far.
#[derive(Debug, Clone, Default)]
pub struct DriverLog {
    pub lines: Vec<String>,
    pub controls: Vec<ControlRequest>,
    pub checks: u32,
    pub redeliveries: u32,
}

#[derive(Debug, Default)]
pub(crate) struct DriverState {
    faults: FaultPlan,
    log: DriverLog,
    last_response: Option<CommandResponse>,
    telemetry: Telemetry,
    job: Option<JobId>,
}

/// Handle to a simulated driver; clones share state.
#[derive(Debug, Clone)]
pub struct SimDriverHandle {
    driver: DriverRef,
    state: Arc<Mutex<DriverState>>,
}

impl SimDriverHandle {
    pub(crate) fn new(driver: DriverRef) -> Self {
        let state = DriverState {
            telemetry: Telemetry {
                extruder_temp: 21.0,
                bed_temp: 21.0,
                ..Default::default()
            },
            ..Default::default()
        };
        Self {
            driver,
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn driver(&self) -> &DriverRef {
        &self.driver
    }

    pub fn set_silent(&self, silent: bool) {
        self.lock().faults.silent = silent;
    }

    pub fn drop_next_responses(&self, count: u32) {
        self.lock().faults.drop_responses = count;
    }

    pub fn duplicate_responses(&self, enabled: bool) {
        self.lock().faults.duplicate_responses = enabled;
    }

    pub fn reject_lines_after(&self, lines: Option<u64>) {
        self.lock().faults.reject_lines_after = lines;
    }

    pub fn stall_lines_after(&self, lines: Option<u64>) {
        self.lock().faults.stall_lines_after = lines;
    }

    pub fn inject_exception(&self, exception: AgentException) {
        self.lock().faults.exceptions.push(exception);
    }

    pub fn log(&self) -> DriverLog {
        self.lock().log.clone()
    }

    pub fn executed_lines(&self) -> u64 {
        self.lock().log.lines.len() as u64
    }

    pub(crate) fn heartbeat(&self) -> Option<Inbound> {
        let state = self.lock();
        if state.faults.silent {
            return None;
        }
        let status = if state.job.is_some() {
            AgentStatus::Busy
        } else {
            AgentStatus::Online
        };
        Some(Inbound::Heartbeat(Heartbeat {
            driver: self.driver.clone(),
            status,
        }))
    }

    pub(crate) fn on_command(&self, request: CommandRequest) -> Vec<Inbound> {
        let mut state = self.lock();
        if state.faults.silent {
            return Vec::new();
        }

        let replay = state
            .last_response
            .as_ref()
            .filter(|last| last.request_id == request.request_id)
            .cloned();
        let response = if let Some(previous) = replay {
            state.log.redeliveries += 1;
            tracing::debug!(
                driver = %self.driver,
                request = %request.request_id,
                "redelivered command answered again"
            );
            previous
        } else {
            let response = match request.payload {
                CommandPayload::Line(text) => {
                    let executed = state.log.lines.len() as u64;
                    if state.faults.stall_lines_after.is_some_and(|limit| executed >= limit) {
                        let request = request.request_id;
                        tracing::debug!(driver = %self.driver, %request, "line stalled");
                        return Vec::new();
                    }
                    if state.faults.reject_lines_after.is_some_and(|limit| executed >= limit) {
                        self.rejected(request.request_id, "LINE_REJECTED: printer is holding")
                    } else {
                        apply_line(&mut state.telemetry, &text);
                        state.log.lines.push(text);
                        state.telemetry.last_command_offset = state.log.lines.len() as u64;
                        self.ok(request.request_id)
                    }
                }
                CommandPayload::Control(control) => {
                    match control.action {
                        ControlAction::Start => state.job = control.job_ref,
                        ControlAction::Stop => state.job = None,
                        ControlAction::Pause => {}
                    }
                    tracing::debug!(
                        driver = %self.driver,
                        action = ?control.action,
                        "control request executed"
                    );
                    state.log.controls.push(control);
                    self.ok(request.request_id)
                }
            };
            state.last_response = Some(response.clone());
            response
        };

        if state.faults.drop_responses > 0 {
            state.faults.drop_responses -= 1;
            let request = response.request_id;
            tracing::debug!(driver = %self.driver, %request, "response dropped");
            return Vec::new();
        }
        let message = Inbound::CommandResponse(response);
        if state.faults.duplicate_responses {
            vec![message.clone(), message]
        } else {
            vec![message]
        }
    }

    pub(crate) fn on_check(&self, request: CheckRequest) -> Option<Inbound> {
        let mut state = self.lock();
        if state.faults.silent {
            return None;
        }
        state.log.checks += 1;
        let mut telemetry = state.telemetry.clone();
        telemetry.exceptions = std::mem::take(&mut state.faults.exceptions);
        Some(Inbound::CheckResponse(CheckResponse {
            driver: self.driver.clone(),
            job_ref: request.job_ref.or(state.job),
            telemetry,
        }))
    }

    fn ok(&self, request_id: RequestId) -> CommandResponse {
        CommandResponse {
            driver: self.driver.clone(),
            request_id,
            ok: true,
            exception: None,
            info: None,
        }
    }

    fn rejected(&self, request_id: RequestId, reason: &str) -> CommandResponse {
        CommandResponse {
            driver: self.driver.clone(),
            request_id,
            ok: false,
            exception: Some(reason.to_string()),
            info: None,
        }
    }

    fn lock(&self) -> MutexGuard<'_, DriverState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Updates axes, temperatures and fan from one G-code line.
fn apply_line(telemetry: &mut Telemetry, line: &str) {
    let mut words = line.split_whitespace();
    let Some(code) = words.next() else {
        return;
    };
    let params: Vec<(char, f64)> = words
        .filter_map(|w| {
            let mut chars = w.chars();
            let letter = chars.next()?.to_ascii_uppercase();
            Some((letter, chars.as_str().parse().ok()?))
        })
        .collect();
    let param = |letter: char| params.iter().find(|(l, _)| *l == letter).map(|(_, v)| *v);

    match code.to_ascii_uppercase().as_str() {
        "G0" | "G1" => {
            if let Some(x) = param('X') {
                telemetry.axes.x = x;
            }
            if let Some(y) = param('Y') {
                telemetry.axes.y = y;
            }
            if let Some(z) = param('Z') {
                if z > telemetry.axes.z {
                    telemetry.layer += 1;
                }
                telemetry.axes.z = z;
            }
            if let Some(e) = param('E') {
                telemetry.axes.e = e;
            }
            if let Some(f) = param('F') {
                telemetry.feed_rate = f;
                telemetry.average_speed = (telemetry.average_speed + f / 60.0) / 2.0;
            }
        }
        "G28" => telemetry.axes = Default::default(),
        "M104" | "M109" => {
            if let Some(s) = param('S') {
                telemetry.extruder_temp = s;
            }
        }
        "M140" | "M190" => {
            if let Some(s) = param('S') {
                telemetry.bed_temp = s;
            }
        }
        "M106" => {
            telemetry.fan_on = true;
            telemetry.fan_speed = param('S').unwrap_or(255.0);
        }
        "M107" => {
            telemetry.fan_on = false;
            telemetry.fan_speed = 0.0;
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_shared::protocol::{CheckCriteria, ExceptionSeverity, PRIORITY_STREAM};

    fn line(driver: &DriverRef, id: u64, text: &str) -> CommandRequest {
        CommandRequest {
            driver: driver.clone(),
            request_id: RequestId(id),
            payload: CommandPayload::Line(text.to_string()),
            priority: PRIORITY_STREAM,
        }
    }

    fn response(messages: &[Inbound]) -> &CommandResponse {
        match &messages[0] {
            Inbound::CommandResponse(r) => r,
            other => panic!("expected command response, got {other:?}"),
        }
    }

    #[test]
    fn lines_update_telemetry() {
        let handle = SimDriverHandle::new(DriverRef::new("sim-0"));
        let driver = handle.driver().clone();
        handle.on_command(line(&driver, 1, "M104 S215"));
        handle.on_command(line(&driver, 2, "G1 X10 Y20 Z0.2 F3000"));
        let check = handle
            .on_check(CheckRequest {
                driver: driver.clone(),
                criteria: CheckCriteria::default(),
                job_ref: None,
            })
            .unwrap();
        let Inbound::CheckResponse(check) = check else {
            panic!("expected check response");
        };
        assert_eq!(check.telemetry.extruder_temp, 215.0);
        assert_eq!(check.telemetry.axes.x, 10.0);
        assert_eq!(check.telemetry.layer, 1);
        assert_eq!(check.telemetry.last_command_offset, 2);
    }

    #[test]
    fn redelivery_is_not_executed_twice() {
        let handle = SimDriverHandle::new(DriverRef::new("sim-0"));
        let driver = handle.driver().clone();
        handle.on_command(line(&driver, 1, "G1 X1"));
        let again = handle.on_command(line(&driver, 1, "G1 X1"));
        assert!(response(&again).ok);
        assert_eq!(handle.executed_lines(), 1);
        assert_eq!(handle.log().redeliveries, 1);
    }

    #[test]
    fn faults_shape_responses() {
        let handle = SimDriverHandle::new(DriverRef::new("sim-0"));
        let driver = handle.driver().clone();

        handle.duplicate_responses(true);
        assert_eq!(handle.on_command(line(&driver, 1, "G1 X1")).len(), 2);
        handle.duplicate_responses(false);

        handle.drop_next_responses(1);
        assert!(handle.on_command(line(&driver, 2, "G1 X2")).is_empty());
        assert_eq!(handle.executed_lines(), 2);

        handle.reject_lines_after(Some(2));
        assert!(!response(&handle.on_command(line(&driver, 3, "G1 X3"))).ok);
        handle.reject_lines_after(None);

        handle.stall_lines_after(Some(2));
        assert!(handle.on_command(line(&driver, 4, "G1 X4")).is_empty());
        assert_eq!(handle.executed_lines(), 2);

        handle.set_silent(true);
        assert!(handle.heartbeat().is_none());
    }

    #[test]
    fn injected_exceptions_are_reported_once() {
        let handle = SimDriverHandle::new(DriverRef::new("sim-0"));
        handle.inject_exception(AgentException {
            code: "FILAMENT_OUT".into(),
            message: "runout sensor".into(),
            severity: ExceptionSeverity::Recoverable,
        });
        let request = CheckRequest {
            driver: handle.driver().clone(),
            criteria: CheckCriteria::default(),
            job_ref: None,
        };
        let Some(Inbound::CheckResponse(first)) = handle.on_check(request.clone()) else {
            panic!("expected check response");
        };
        assert_eq!(first.telemetry.exceptions.len(), 1);
        let Some(Inbound::CheckResponse(second)) = handle.on_check(request) else {
            panic!("expected check response");
        };
        assert!(second.telemetry.exceptions.is_empty());
    }
}
