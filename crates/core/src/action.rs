use std::time::Duration;

use crate::types::{NormalizedPoint, RawPoint};

/// System gesture: swipe up from the bottom centre.
pub const HOME_SWIPE: (RawPoint, RawPoint) = (RawPoint { x: 0.5, y: 0.95 }, RawPoint { x: 0.5, y: 0.2 });
/// System gesture: swipe in from the left edge.
pub const BACK_SWIPE: (RawPoint, RawPoint) = (RawPoint { x: 0.02, y: 0.5 }, RawPoint { x: 0.35, y: 0.5 });

/// A gesture as proposed by the planner, before validation.
#[derive(Debug, Clone, PartialEq)]
pub enum Gesture {
    Tap { at: RawPoint },
    DoubleTap { at: RawPoint },
    LongPress { at: RawPoint, duration_ms: Option<u64> },
    Swipe { from: RawPoint, to: RawPoint },
    Back,
    Home,
    Wait { secs: f64 },
}

/// Planner output that would move (or deliberately not move) the hardware.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub gesture: Gesture,
    /// Optional z / pressure value, checked against the guard's band
    pub pressure: Option<f64>,
    pub reasoning: String,
}

impl Action {
    pub fn new(gesture: Gesture) -> Self {
        Self { gesture, pressure: None, reasoning: String::new() }
    }

    pub fn tap(x: f64, y: f64) -> Self {
        Self::new(Gesture::Tap { at: RawPoint::new(x, y) })
    }

    pub fn swipe(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self::new(Gesture::Swipe { from: RawPoint::new(x1, y1), to: RawPoint::new(x2, y2) })
    }

    pub fn with_pressure(mut self, z: f64) -> Self {
        self.pressure = Some(z);
        self
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = reasoning.into();
        self
    }
}

/// An action that passed the safety guard. Only these reach the transform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GuardedAction {
    Tap(NormalizedPoint),
    DoubleTap(NormalizedPoint),
    LongPress(NormalizedPoint, u64),
    Swipe(NormalizedPoint, NormalizedPoint),
    Wait(Duration),
}

impl GuardedAction {
    pub fn moves_hardware(&self) -> bool {
        !matches!(self, GuardedAction::Wait(_))
    }
}
