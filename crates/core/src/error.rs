use std::fmt;

use thiserror::Error;

/// Which coordinate of an action tripped the guard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
    StartX,
    StartY,
    EndX,
    EndY,
    Z,
    Wait,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Axis::X => "x",
            Axis::Y => "y",
            Axis::StartX => "start x",
            Axis::StartY => "start y",
            Axis::EndX => "end x",
            Axis::EndY => "end y",
            Axis::Z => "z",
            Axis::Wait => "wait seconds",
        };
        f.write_str(s)
    }
}

/// A commanded coordinate outside the working envelope. Never clamped.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{axis} = {value} outside safe range [{min}, {max}]")]
pub struct SafetyViolation {
    pub axis: Axis,
    pub value: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport disconnected")]
    Disconnected,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("http error: {0}")]
    Http(String),
    #[error("device rejected request: HTTP {status}")]
    Rejected { status: u16 },
    #[error("login failed: {0}")]
    LoginFailed(String),
    #[error("no serial port available")]
    NoPort,
}

impl From<ureq::Error> for TransportError {
    fn from(e: ureq::Error) -> Self {
        TransportError::Http(e.to_string())
    }
}

#[derive(Error, Debug)]
pub enum PerceptionError {
    #[error("perception service error: {0}")]
    Http(String),
    #[error("malformed perception reply: {0}")]
    Malformed(String),
    #[error("no action produced: {0}")]
    NoAction(String),
}

impl From<ureq::Error> for PerceptionError {
    fn from(e: ureq::Error) -> Self {
        PerceptionError::Http(e.to_string())
    }
}

/// Errors `step()` raises instead of reporting through a `StepResult`.
#[derive(Error, Debug)]
pub enum StepError {
    #[error("safety violation: {0}")]
    Safety(#[from] SafetyViolation),
    #[error("planner requested take-over: {0}")]
    TakeOver(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("cancelled")]
    Cancelled,
}

#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("parse error at line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error("safety violation: {0}")]
    Safety(SafetyViolation),
    #[error("planner requested take-over: {0}")]
    TakeOver(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("step '{goal}' failed: {reason}")]
    StepFailed { goal: String, reason: String },
    #[error("step limit of {0} exceeded")]
    StepLimit(usize),
    #[error("instruction limit of {0} exceeded")]
    InstructionLimit(usize),
    #[error("cancelled")]
    Cancelled,
}

impl ScriptError {
    /// Short machine-friendly tag for structured outcomes.
    pub fn kind(&self) -> &'static str {
        match self {
            ScriptError::Parse { .. } => "parse",
            ScriptError::Runtime(_) => "runtime",
            ScriptError::Safety(_) => "safety",
            ScriptError::TakeOver(_) => "take_over",
            ScriptError::Query(_) => "query",
            ScriptError::StepFailed { .. } => "max_retries",
            ScriptError::StepLimit(_) => "step_limit",
            ScriptError::InstructionLimit(_) => "instruction_limit",
            ScriptError::Cancelled => "cancelled",
        }
    }
}

impl From<StepError> for ScriptError {
    fn from(e: StepError) -> Self {
        match e {
            StepError::Safety(v) => ScriptError::Safety(v),
            StepError::TakeOver(r) => ScriptError::TakeOver(r),
            StepError::Query(m) => ScriptError::Query(m),
            StepError::Cancelled => ScriptError::Cancelled,
        }
    }
}

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("settings i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings json: {0}")]
    Json(#[from] serde_json::Error),
}
