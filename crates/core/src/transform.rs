use std::sync::RwLock;

use crate::logger;
use crate::types::{NormalizedPoint, PhysicalPoint, WorkArea};

/// Smallest span accepted on either axis, in device units.
pub const MIN_SPAN: i32 = 100;

/// normalized -> physical for one area: `origin + n * (extent - origin)`
pub fn to_physical(p: NormalizedPoint, area: &WorkArea) -> PhysicalPoint {
    let x = area.origin_x as f64 + p.x() * area.width() as f64;
    let y = area.origin_y as f64 + p.y() * area.height() as f64;
    PhysicalPoint::new(x.round() as i32, y.round() as i32)
}

/// physical -> normalized, clamped into [0, 1] to absorb calibration rounding.
pub fn to_normalized(p: PhysicalPoint, area: &WorkArea) -> NormalizedPoint {
    let w = area.width();
    let h = area.height();
    let nx = if w > 0 { (p.x as i64 - area.origin_x as i64) as f64 / w as f64 } else { 0.0 };
    let ny = if h > 0 { (p.y as i64 - area.origin_y as i64) as f64 / h as f64 } else { 0.0 };
    NormalizedPoint::clamped(nx, ny)
}

/// Enforce `extent > origin` on both axes by widening to `MIN_SPAN`.
pub fn sanitize(area: WorkArea) -> WorkArea {
    let (origin_x, extent_x) = widen(area.origin_x, area.extent_x);
    let (origin_y, extent_y) = widen(area.origin_y, area.extent_y);
    WorkArea { origin_x, origin_y, extent_x, extent_y }
}

// Near i32::MAX the span grows downward instead.
fn widen(origin: i32, extent: i32) -> (i32, i32) {
    if extent as i64 - origin as i64 >= MIN_SPAN as i64 {
        return (origin, extent);
    }
    match origin.checked_add(MIN_SPAN) {
        Some(e) => (origin, e),
        None => (i32::MAX - MIN_SPAN, i32::MAX),
    }
}

/// Owner of the calibration. `set_work_area` is the only mutator.
#[derive(Debug)]
pub struct CoordinateTransform {
    area: RwLock<WorkArea>,
}

impl CoordinateTransform {
    pub fn new(area: WorkArea) -> Self {
        Self { area: RwLock::new(sanitize(area)) }
    }

    /// Copy of the current calibration; a multi-point gesture must use one snapshot.
    pub fn snapshot(&self) -> WorkArea {
        *self.area.read().unwrap()
    }

    pub fn set_work_area(&self, area: WorkArea) -> WorkArea {
        let fixed = sanitize(area);
        if fixed != area {
            logger::warn(&format!("degenerate work area {:?} widened to {:?}", area, fixed));
        }
        *self.area.write().unwrap() = fixed;
        logger::info(&format!(
            "work area set: ({},{}) -> ({},{})",
            fixed.origin_x, fixed.origin_y, fixed.extent_x, fixed.extent_y
        ));
        fixed
    }

    pub fn to_physical(&self, p: NormalizedPoint) -> PhysicalPoint {
        to_physical(p, &self.snapshot())
    }

    pub fn to_normalized(&self, p: PhysicalPoint) -> NormalizedPoint {
        to_normalized(p, &self.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand::rngs::StdRng;

    #[test]
    fn centre_of_default_area() {
        let t = CoordinateTransform::new(WorkArea::new(0, 0, 3900, 6300));
        let p = t.to_physical(NormalizedPoint::new(0.5, 0.5).unwrap());
        assert_eq!(p, PhysicalPoint::new(1950, 3150));
    }

    #[test]
    fn offset_origin() {
        let area = WorkArea::new(1200, 90, 3750, 6300);
        let p = to_physical(NormalizedPoint::new(0.0, 1.0).unwrap(), &area);
        assert_eq!(p, PhysicalPoint::new(1200, 6300));
        let p = to_physical(NormalizedPoint::new(1.0, 0.0).unwrap(), &area);
        assert_eq!(p, PhysicalPoint::new(3750, 90));
    }

    #[test]
    fn inverse_clamps_sensed_values() {
        let area = WorkArea::new(100, 100, 1100, 1100);
        let n = to_normalized(PhysicalPoint::new(50, 2000), &area);
        assert_eq!((n.x(), n.y()), (0.0, 1.0));
    }

    #[test]
    fn degenerate_area_is_widened() {
        let t = CoordinateTransform::new(WorkArea::default());
        let fixed = t.set_work_area(WorkArea::new(500, 500, 500, 400));
        assert_eq!(fixed, WorkArea::new(500, 500, 600, 600));
        assert_eq!(t.snapshot().width(), MIN_SPAN as i64);
        // no division by zero downstream
        let n = t.to_normalized(PhysicalPoint::new(550, 550));
        assert!((n.x() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn extreme_corners_do_not_overflow() {
        let t = CoordinateTransform::new(WorkArea::new(2_147_483_600, 0, i32::MAX, 6300));
        let a = t.snapshot();
        assert_eq!((a.origin_x, a.extent_x), (i32::MAX - MIN_SPAN, i32::MAX));
        assert_eq!(t.to_physical(NormalizedPoint::new(1.0, 0.0).unwrap()), PhysicalPoint::new(i32::MAX, 0));

        let wide = WorkArea::new(i32::MIN, i32::MIN, i32::MAX, i32::MAX);
        assert_eq!(sanitize(wide), wide);
        assert_eq!(wide.width(), u32::MAX as i64);
        let n = to_normalized(PhysicalPoint::new(i32::MAX, i32::MIN), &wide);
        assert_eq!((n.x(), n.y()), (1.0, 0.0));
        let centre = to_physical(NormalizedPoint::new(0.5, 0.5).unwrap(), &wide);
        assert!(centre.x.abs() <= 1 && centre.y.abs() <= 1, "{centre:?}");
    }

    #[test]
    fn round_trip_within_one_unit() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let ox = rng.gen_range(0..2000);
            let oy = rng.gen_range(0..2000);
            let area = WorkArea::new(ox, oy, ox + rng.gen_range(100..4000), oy + rng.gen_range(100..6000));
            for _ in 0..50 {
                let q = PhysicalPoint::new(
                    rng.gen_range(area.origin_x..=area.extent_x),
                    rng.gen_range(area.origin_y..=area.extent_y),
                );
                let back = to_physical(to_normalized(q, &area), &area);
                assert!((back.x - q.x).abs() <= 1 && (back.y - q.y).abs() <= 1, "{:?} -> {:?} in {:?}", q, back, area);
            }
        }
    }
}
