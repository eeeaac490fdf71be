use std::time::Duration;

use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::UpdateError;
use crate::stage::{StageClass, StagePhase, UpdateStage};

const COMMUNICATION_FAILED: &str =
    "Internal communication to device failed! Please observe the device display for the current state.";

/// Pseudo stage used for the deadline before the first state arrives.
const AWAITING_FIRST_STATE: &str = "AWAITING_STATE";

/// One decoded poll reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub tag: String,
    pub error_reason: Option<String>,
    /// Device-supplied timeout for this stage, in seconds.
    pub timeout_secs: Option<u64>,
}

impl StageReport {
    /// Decode a poll body.
    ///
    /// Accepts the flat state file and the `Reply` envelope. Returns
    /// `Ok(None)` for an envelope that reports no usable state this time.
    pub fn parse(body: &str) -> Result<Option<StageReport>, UpdateError> {
        let value: Value = serde_json::from_str(body.trim()).map_err(|e| {
            debug!("unparseable state reply: {}", e);
            UpdateError::Communication(COMMUNICATION_FAILED.to_string())
        })?;
        let object = value
            .as_object()
            .ok_or_else(|| UpdateError::Communication(COMMUNICATION_FAILED.to_string()))?;

        let holder = if object.get("msgType").and_then(Value::as_str) == Some("Reply") {
            let refers_to_status = object.get("refMsgType").and_then(Value::as_str) == Some("RequestSoftwareUpdateStatus");
            let succeeded = object.get("success").and_then(Value::as_bool) == Some(true);
            if !refers_to_status || !succeeded {
                debug!("ignoring reply envelope: {}", body.trim());
                return Ok(None);
            }
            match object.get("data").and_then(Value::as_object) {
                Some(data) => data,
                None => return Err(UpdateError::Communication(COMMUNICATION_FAILED.to_string())),
            }
        } else {
            object
        };

        let tag = holder
            .get("State")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .ok_or_else(|| UpdateError::Communication(COMMUNICATION_FAILED.to_string()))?;

        let error_reason = holder
            .get("ErrorReason")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|reason| !reason.is_empty())
            .map(str::to_string);

        Ok(Some(StageReport { tag: tag.to_string(), error_reason, timeout_secs: parse_timeout(object) }))
    }
}

/// Positive integer seconds, sent either as a number or a string.
fn parse_timeout(object: &Map<String, Value>) -> Option<u64> {
    let seconds = match object.get("timeout")? {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().filter(|f| *f >= 1.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    seconds.filter(|s| *s > 0)
}

/// A non-terminal stage the device moved into.
#[derive(Debug, Clone, PartialEq)]
pub struct StageProgress {
    pub stage: UpdateStage,
    pub percent: u8,
    pub message: String,
    pub phase: StagePhase,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// Same tag as last time; nothing to do.
    Unchanged,
    Progress(StageProgress),
    Succeeded { stage: UpdateStage, message: String },
    /// The device came back up, but on the previous firmware.
    RolledBack { stage: UpdateStage, cause: UpdateStage, message: String },
}

#[derive(Debug, Clone)]
struct ArmedTimeout {
    stage: String,
    deadline: Instant,
    duration: Duration,
}

/// Follows the device through its validation stages.
///
/// Only a change of tag counts: re-reading the same tag neither re-arms the
/// stage timeout nor produces an event. Terminal failures are returned as
/// errors and end the machine. Once a rollback stage was seen, a later
/// success stage only means the old image is running again.
#[derive(Debug, Clone)]
pub struct UpdateProgressStateMachine {
    default_timeout: Duration,
    last_tag: Option<String>,
    armed: Option<ArmedTimeout>,
    rollback: Option<UpdateStage>,
    finished: bool,
}

impl UpdateProgressStateMachine {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout, last_tag: None, armed: None, rollback: None, finished: false }
    }

    /// Start watching. The default timeout bounds the wait for the first
    /// state so an unreachable device cannot hang the session.
    pub fn begin(&mut self, now: Instant) {
        self.last_tag = None;
        self.rollback = None;
        self.finished = false;
        self.arm(AWAITING_FIRST_STATE, self.default_timeout, now);
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.armed.as_ref().map(|armed| armed.deadline)
    }

    /// Whether the device went into rollback during this session.
    pub fn rollback_cause(&self) -> Option<UpdateStage> {
        self.rollback
    }

    pub fn observe(&mut self, report: &StageReport, now: Instant) -> Result<Observation, UpdateError> {
        // A reply that lands after the deadline cannot rescue the stage.
        if let Some(error) = self.check_deadline(now) {
            return Err(error);
        }
        if self.finished || self.last_tag.as_deref() == Some(report.tag.as_str()) {
            return Ok(Observation::Unchanged);
        }
        self.last_tag = Some(report.tag.clone());

        let timeout = report.timeout_secs.map(Duration::from_secs).unwrap_or(self.default_timeout);
        self.arm(&report.tag, timeout, now);

        let Some(stage) = UpdateStage::from_tag(&report.tag) else {
            warn!("device reported unknown state {}", report.tag);
            self.finish();
            return Err(UpdateError::UnknownStage(report.tag.clone()));
        };

        let message = stage.describe(report.error_reason.as_deref());
        if stage.is_terminal() {
            self.finish();
            return match (stage.class(), self.rollback) {
                (StageClass::Success, Some(cause)) => {
                    let message = format!("{} Device rolled back to the previous firmware after {}.", message, cause);
                    warn!("device finished in {} after rollback", stage);
                    Ok(Observation::RolledBack { stage, cause, message })
                }
                (StageClass::Success, None) => {
                    info!("device finished in {}: {}", stage, message);
                    Ok(Observation::Succeeded { stage, message })
                }
                _ => Err(UpdateError::DeviceReported { stage: stage.tag().to_string(), message }),
            };
        }
        if stage.class() == StageClass::Rollback && self.rollback.is_none() {
            self.rollback = Some(stage);
        }

        info!("device entered {} ({}%), timeout {}s", stage, stage.percent(), timeout.as_secs());
        Ok(Observation::Progress(StageProgress {
            stage,
            percent: stage.percent(),
            message,
            phase: stage.phase(),
            timeout,
        }))
    }

    /// The stage timeout, once `now` reached the armed deadline.
    pub fn check_deadline(&mut self, now: Instant) -> Option<UpdateError> {
        let armed = self.armed.as_ref()?;
        if self.finished || now < armed.deadline {
            return None;
        }
        let error = UpdateError::StageTimeout { stage: armed.stage.clone(), seconds: armed.duration.as_secs() };
        warn!("{}", error);
        self.finish();
        Some(error)
    }

    fn arm(&mut self, stage: &str, duration: Duration, now: Instant) {
        self.armed = Some(ArmedTimeout { stage: stage.to_string(), deadline: now + duration, duration });
    }

    fn finish(&mut self) {
        self.finished = true;
        self.armed = None;
    }
}
