//! Safety boundary for every actuation.
//!
//! All coordinates are validated against the normalized envelope and an
//! optional z / pressure value against a fixed band. Violations are
//! returned to the caller; nothing here clamps.

use std::time::Duration;

use crate::action::{Action, Gesture, GuardedAction, BACK_SWIPE, HOME_SWIPE};
use crate::error::{Axis, SafetyViolation};
use crate::types::{NormalizedPoint, RawPoint, DEFAULT_LONG_PRESS_MS};

pub const UNIT_MIN: f64 = 0.0;
pub const UNIT_MAX: f64 = 1.0;
/// Longest planner-requested idle wait
pub const MAX_WAIT_SECS: f64 = 60.0;

/// Check one normalized component. NaN is always a violation.
pub fn check_unit(axis: Axis, value: f64) -> Result<(), SafetyViolation> {
    if (UNIT_MIN..=UNIT_MAX).contains(&value) {
        Ok(())
    } else {
        Err(SafetyViolation { axis, value, min: UNIT_MIN, max: UNIT_MAX })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SafetyGuard {
    z_min: f64,
    z_max: f64,
}

impl Default for SafetyGuard {
    fn default() -> Self {
        Self { z_min: 0.0, z_max: 100.0 }
    }
}

impl SafetyGuard {
    pub fn new(z_min: f64, z_max: f64) -> Self {
        Self { z_min, z_max }
    }

    /// Validate an action and turn it into its typed, in-range form.
    pub fn check(&self, action: &Action) -> Result<GuardedAction, SafetyViolation> {
        if let Some(z) = action.pressure {
            if !(self.z_min..=self.z_max).contains(&z) {
                return Err(SafetyViolation { axis: Axis::Z, value: z, min: self.z_min, max: self.z_max });
            }
        }

        match action.gesture {
            Gesture::Tap { at } => Ok(GuardedAction::Tap(single(at)?)),
            Gesture::DoubleTap { at } => Ok(GuardedAction::DoubleTap(single(at)?)),
            Gesture::LongPress { at, duration_ms } => Ok(GuardedAction::LongPress(
                single(at)?,
                duration_ms.unwrap_or(DEFAULT_LONG_PRESS_MS),
            )),
            Gesture::Swipe { from, to } => swipe(from, to),
            Gesture::Back => swipe(BACK_SWIPE.0, BACK_SWIPE.1),
            Gesture::Home => swipe(HOME_SWIPE.0, HOME_SWIPE.1),
            Gesture::Wait { secs } => {
                if (0.0..=MAX_WAIT_SECS).contains(&secs) {
                    Ok(GuardedAction::Wait(Duration::from_secs_f64(secs)))
                } else {
                    Err(SafetyViolation { axis: Axis::Wait, value: secs, min: 0.0, max: MAX_WAIT_SECS })
                }
            }
        }
    }
}

fn single(p: RawPoint) -> Result<NormalizedPoint, SafetyViolation> {
    NormalizedPoint::checked(p.x, p.y, Axis::X, Axis::Y)
}

fn swipe(from: RawPoint, to: RawPoint) -> Result<GuardedAction, SafetyViolation> {
    let a = NormalizedPoint::checked(from.x, from.y, Axis::StartX, Axis::StartY)?;
    let b = NormalizedPoint::checked(to.x, to.y, Axis::EndX, Axis::EndY)?;
    Ok(GuardedAction::Swipe(a, b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand::rngs::StdRng;

    #[test]
    fn in_range_tap_passes() {
        let g = SafetyGuard::default().check(&Action::tap(0.5, 0.5)).unwrap();
        assert!(matches!(g, GuardedAction::Tap(p) if p.x() == 0.5 && p.y() == 0.5));
    }

    #[test]
    fn edges_are_inclusive() {
        let guard = SafetyGuard::default();
        assert!(guard.check(&Action::tap(0.0, 1.0)).is_ok());
        assert!(guard.check(&Action::swipe(0.0, 0.0, 1.0, 1.0)).is_ok());
    }

    #[test]
    fn violation_names_axis_and_bound() {
        let err = SafetyGuard::default().check(&Action::tap(1.5, 0.5)).unwrap_err();
        assert_eq!(err.axis, Axis::X);
        assert_eq!(err.value, 1.5);
        assert_eq!(err.max, 1.0);
        assert!(err.to_string().contains("x = 1.5"));

        let err = SafetyGuard::default().check(&Action::tap(0.5, -0.1)).unwrap_err();
        assert_eq!(err.axis, Axis::Y);
    }

    #[test]
    fn swipe_end_point_is_checked() {
        let err = SafetyGuard::default().check(&Action::swipe(0.2, 0.2, 1.2, 0.5)).unwrap_err();
        assert_eq!(err.axis, Axis::EndX);
    }

    #[test]
    fn pressure_band() {
        let guard = SafetyGuard::default();
        assert!(guard.check(&Action::tap(0.5, 0.5).with_pressure(50.0)).is_ok());
        let err = guard.check(&Action::tap(0.5, 0.5).with_pressure(101.0)).unwrap_err();
        assert_eq!(err.axis, Axis::Z);
        assert!(guard.check(&Action::tap(0.5, 0.5).with_pressure(-1.0)).is_err());
    }

    #[test]
    fn nan_is_rejected() {
        assert!(SafetyGuard::default().check(&Action::tap(f64::NAN, 0.5)).is_err());
        assert!(SafetyGuard::default().check(&Action::new(Gesture::Wait { secs: f64::NAN })).is_err());
    }

    #[test]
    fn system_gestures_resolve_to_swipes() {
        let guard = SafetyGuard::default();
        match guard.check(&Action::new(Gesture::Home)).unwrap() {
            GuardedAction::Swipe(a, b) => {
                assert_eq!((a.x(), a.y()), (0.5, 0.95));
                assert_eq!((b.x(), b.y()), (0.5, 0.2));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(guard.check(&Action::new(Gesture::Back)).unwrap(), GuardedAction::Swipe(..)));
    }

    #[test]
    fn randomized_points_match_envelope() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let guard = SafetyGuard::default();
        for _ in 0..5000 {
            let x: f64 = rng.gen_range(-1.0..2.0);
            let y: f64 = rng.gen_range(-1.0..2.0);
            let inside = (0.0..=1.0).contains(&x) && (0.0..=1.0).contains(&y);
            assert_eq!(guard.check(&Action::tap(x, y)).is_ok(), inside, "({x}, {y})");

            let x2: f64 = rng.gen_range(-1.0..2.0);
            let y2: f64 = rng.gen_range(-1.0..2.0);
            let both = inside && (0.0..=1.0).contains(&x2) && (0.0..=1.0).contains(&y2);
            assert_eq!(guard.check(&Action::swipe(x, y, x2, y2)).is_ok(), both);
        }
    }
}
