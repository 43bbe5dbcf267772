use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::{Axis, SafetyViolation};
use crate::safety;
use crate::transform::{to_normalized, to_physical};

/// Unvalidated point as proposed by the planner (may be out of range)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawPoint {
    pub x: f64,
    pub y: f64,
}

impl RawPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Perceptual coordinate. Both components are always within [0.0, 1.0].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NormalizedPoint {
    x: f64,
    y: f64,
}

impl NormalizedPoint {
    /// Validate a point; out-of-range components are a violation, never clamped.
    pub fn new(x: f64, y: f64) -> Result<Self, SafetyViolation> {
        Self::checked(x, y, Axis::X, Axis::Y)
    }

    pub(crate) fn checked(x: f64, y: f64, ax: Axis, ay: Axis) -> Result<Self, SafetyViolation> {
        safety::check_unit(ax, x)?;
        safety::check_unit(ay, y)?;
        Ok(Self { x, y })
    }

    /// Only for sensed values being mapped back for verification.
    pub(crate) fn clamped(x: f64, y: f64) -> Self {
        let fix = |v: f64| if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) };
        Self { x: fix(x), y: fix(y) }
    }

    pub fn x(&self) -> f64 {
        self.x
    }

    pub fn y(&self) -> f64 {
        self.y
    }
}

/// Actuator-space coordinate (device units)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PhysicalPoint {
    pub x: i32,
    pub y: i32,
}

impl PhysicalPoint {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Calibrated physical rectangle covering the normalized 0..1 range.
/// `origin` is the near corner, `extent` the far corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkArea {
    pub origin_x: i32,
    pub origin_y: i32,
    pub extent_x: i32,
    pub extent_y: i32,
}

impl Default for WorkArea {
    fn default() -> Self {
        Self { origin_x: 0, origin_y: 0, extent_x: 3900, extent_y: 6300 }
    }
}

impl WorkArea {
    pub fn new(origin_x: i32, origin_y: i32, extent_x: i32, extent_y: i32) -> Self {
        Self { origin_x, origin_y, extent_x, extent_y }
    }

    /// Span in i64 so any pair of i32 corners fits.
    pub fn width(&self) -> i64 {
        self.extent_x as i64 - self.origin_x as i64
    }

    pub fn height(&self) -> i64 {
        self.extent_y as i64 - self.origin_y as i64
    }
}

/// Device click codes used by the serial protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClickKind {
    Click = 1,
    Double = 2,
    Long = 3,
}

impl ClickKind {
    pub fn code(self) -> u8 {
        self as u8
    }
}

pub const DEFAULT_SPEED: u32 = 100;
pub const DEFAULT_LONG_PRESS_MS: u64 = 2000;

/// A commanded position: the device point plus the exact normalized value
/// it was mapped from, which is what goes on the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Target {
    pub point: PhysicalPoint,
    pub norm: NormalizedPoint,
}

impl Target {
    pub fn new(norm: NormalizedPoint, area: &WorkArea) -> Self {
        Self { point: to_physical(norm, area), norm }
    }

    /// For a raw device point; the normalized value is derived back from it.
    pub fn from_point(point: PhysicalPoint, area: &WorkArea) -> Self {
        Self { point, norm: to_normalized(point, area) }
    }
}

/// One physical motion
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Motion {
    Move { at: PhysicalPoint },
    Click { at: Target, speed: u32 },
    DoubleClick { at: Target, speed: u32 },
    LongPress { at: Target, speed: u32, duration_ms: u64 },
    Drag { from: Target, to: Target, speed: u32 },
    Home,
}

impl Motion {
    pub fn name(&self) -> &'static str {
        match self {
            Motion::Move { .. } => "move",
            Motion::Click { .. } => "click",
            Motion::DoubleClick { .. } => "double_click",
            Motion::LongPress { .. } => "long_press",
            Motion::Drag { .. } => "drag",
            Motion::Home => "home",
        }
    }

    /// Click code, target and speed for the move_click family
    pub fn click(&self) -> Option<(ClickKind, Target, u32)> {
        match *self {
            Motion::Click { at, speed } => Some((ClickKind::Click, at, speed)),
            Motion::DoubleClick { at, speed } => Some((ClickKind::Double, at, speed)),
            Motion::LongPress { at, speed, .. } => Some((ClickKind::Long, at, speed)),
            _ => None,
        }
    }
}

/// A motion bound to the calibration snapshot it was computed against.
/// Immutable once built; consumed exactly once by the queue.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActuationCommand {
    pub motion: Motion,
    pub area: WorkArea,
}

impl ActuationCommand {
    pub fn new(motion: Motion, area: WorkArea) -> Self {
        Self { motion, area }
    }
}

/// Lifecycle of a queued command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Queued,
    Executing,
    Acknowledged,
    TimedOut,
}

/// Queue bookkeeping for one command
#[derive(Debug, Clone)]
pub struct PendingCommand {
    pub seq: u64,
    pub command: ActuationCommand,
    pub enqueued_at: Instant,
    pub state: CommandState,
    pub(crate) ticket: u64,
}

/// How a command left the queue
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Acknowledged,
    /// Device answered with an error line, or the transport refused the write
    Failed(String),
    TimedOut,
}

impl CommandOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, CommandOutcome::Acknowledged)
    }

    /// An error line is still an answer from the device.
    pub fn settled_state(&self) -> CommandState {
        match self {
            CommandOutcome::TimedOut => CommandState::TimedOut,
            CommandOutcome::Acknowledged | CommandOutcome::Failed(_) => CommandState::Acknowledged,
        }
    }
}

/// Signal read back from the device by a background listener
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceAck {
    Ready,
    Error(String),
}

/// Result of one `step()` call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepResult {
    pub success: bool,
    pub state: String,
    pub has_more: bool,
    pub error: Option<String>,
    pub retries: u32,
}

/// Shared cancellation flag, checked at state-machine boundaries
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
