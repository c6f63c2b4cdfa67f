//! Axis-aligned bounding boxes and distance ranges
//!
//! Contains the 3D AABB used at the object and voxel level, and the
//! interval-valued distance range the candidate pruner orders by.

use serde::{Deserialize, Serialize};

/// An interval `[closest, farthest]` enclosing the true distance between
/// two geometric entities.
///
/// Two ranges are only ordered when they do not overlap: `r1` is strictly
/// closer than `r2` iff `r1.farthest < r2.closest`. Overlapping ranges are
/// indeterminate and compare neither closer nor farther.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DistanceRange {
    pub closest: f32,
    pub farthest: f32,
}

impl DistanceRange {
    pub fn new(closest: f32, farthest: f32) -> Self {
        debug_assert!(closest <= farthest);
        Self { closest, farthest }
    }

    /// A zero-width range around an exact measurement.
    pub fn exact(d: f32) -> Self {
        Self { closest: d, farthest: d }
    }

    /// Strictly closer: no overlap with `other`.
    pub fn closer_than(&self, other: &DistanceRange) -> bool {
        self.farthest < other.closest
    }

    /// Strictly farther: no overlap with `other`.
    pub fn farther_than(&self, other: &DistanceRange) -> bool {
        self.closest > other.farthest
    }

    /// Narrow this range with another bound on the same distance.
    ///
    /// Refinement only ever lowers the farthest bound, and any new
    /// measurement is an upper bound on the true distance, so both
    /// components take the minimum.
    pub fn update(&mut self, other: &DistanceRange) {
        self.closest = self.closest.min(other.closest);
        self.farthest = self.farthest.min(other.farthest);
    }
}

/// Axis-aligned bounding box in 3D
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

impl Aabb {
    pub fn new(min: [f32; 3], max: [f32; 3]) -> Self {
        Self { min, max }
    }

    /// An inverted box that any `update` will replace; used as the seed
    /// when accumulating a union.
    pub fn empty() -> Self {
        Self {
            min: [f32::MAX; 3],
            max: [f32::MIN; 3],
        }
    }

    /// Closed-interval overlap test; boxes that merely touch intersect.
    pub fn intersects(&self, other: &Aabb) -> bool {
        (0..3).all(|i| self.min[i] <= other.max[i] && self.max[i] >= other.min[i])
    }

    /// Grow to contain `other`.
    pub fn update(&mut self, other: &Aabb) {
        for i in 0..3 {
            self.min[i] = self.min[i].min(other.min[i]);
            self.max[i] = self.max[i].max(other.max[i]);
        }
    }

    /// Distance interval to another box.
    ///
    /// `closest` is the gap between the boxes (0 when they overlap);
    /// `farthest` is the distance between the farthest corner pair. Any
    /// point-to-point distance between contents of the two boxes lies
    /// inside the returned range.
    pub fn distance(&self, other: &Aabb) -> DistanceRange {
        let mut closest_sq = 0.0f32;
        let mut farthest_sq = 0.0f32;
        for i in 0..3 {
            let gap = (self.min[i] - other.max[i]).max(other.min[i] - self.max[i]).max(0.0);
            closest_sq += gap * gap;
            let span = (self.max[i] - other.min[i]).max(other.max[i] - self.min[i]);
            farthest_sq += span * span;
        }
        DistanceRange::new(closest_sq.sqrt(), farthest_sq.sqrt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intersects_touching_boxes() {
        let a = Aabb::new([0.0, 0.0, 0.0], [1.0, 1.0, 1.0]);
        let b = Aabb::new([1.0, 0.0, 0.0], [2.0, 1.0, 1.0]);
        let c = Aabb::new([2.5, 0.0, 0.0], [3.0, 1.0, 1.0]);
        assert!(a.intersects(&b), "touching boxes must intersect");
        assert!(b.intersects(&a));
        assert!(!a.intersects(&c));
    }

    #[test]
    fn test_distance_disjoint_boxes() {
        let a = Aabb::new([0.0, 0.0, 0.0], [1.0, 1.0, 1.0]);
        let b = Aabb::new([10.0, 10.0, 10.0], [11.0, 11.0, 11.0]);
        let d = a.distance(&b);
        let expected_closest = (3.0f32 * 81.0).sqrt(); // 9 per axis
        let expected_farthest = (3.0f32 * 121.0).sqrt(); // 11 per axis
        assert!((d.closest - expected_closest).abs() < 1e-3);
        assert!((d.farthest - expected_farthest).abs() < 1e-3);
    }

    #[test]
    fn test_distance_overlapping_boxes() {
        let a = Aabb::new([0.0, 0.0, 0.0], [2.0, 2.0, 2.0]);
        let b = Aabb::new([1.0, 1.0, 1.0], [3.0, 3.0, 3.0]);
        let d = a.distance(&b);
        assert_eq!(d.closest, 0.0);
        assert!((d.farthest - (3.0f32 * 9.0).sqrt()).abs() < 1e-3);
    }

    #[test]
    fn test_distance_is_lower_bound_on_contents() {
        // Points on the near faces of two disjoint boxes can never be
        // closer than the box gap.
        let a = Aabb::new([0.0, 0.0, 0.0], [1.0, 1.0, 1.0]);
        let b = Aabb::new([5.0, 0.0, 0.0], [6.0, 1.0, 1.0]);
        let d = a.distance(&b);
        let point_dist = 4.0f32; // (1,y,z) to (5,y,z)
        assert!(d.closest <= point_dist);
        assert!(d.farthest >= point_dist);
    }

    #[test]
    fn test_range_ordering() {
        let near = DistanceRange::new(1.0, 3.0);
        let far = DistanceRange::new(5.0, 7.0);
        let mid = DistanceRange::new(2.0, 4.0);
        assert!(near.closer_than(&far));
        assert!(far.farther_than(&near));
        // overlapping ranges are indeterminate
        assert!(!near.closer_than(&mid));
        assert!(!near.farther_than(&mid));
        // boundary contact is overlap, not strict order
        let touch = DistanceRange::new(3.0, 6.0);
        assert!(!near.closer_than(&touch));
        assert!(!touch.farther_than(&near));
    }

    #[test]
    fn test_range_update_narrows() {
        let mut r = DistanceRange::new(2.0, 10.0);
        r.update(&DistanceRange::new(3.0, 8.0));
        assert_eq!(r.closest, 2.0);
        assert_eq!(r.farthest, 8.0);
        r.update(&DistanceRange::new(1.0, 9.0));
        assert_eq!(r.closest, 1.0);
        assert_eq!(r.farthest, 8.0);
    }

    #[test]
    fn test_union_accumulation() {
        let mut total = Aabb::empty();
        total.update(&Aabb::new([0.0, 0.0, 0.0], [1.0, 1.0, 1.0]));
        total.update(&Aabb::new([-2.0, 0.5, 0.0], [0.5, 3.0, 1.0]));
        assert_eq!(total.min, [-2.0, 0.0, 0.0]);
        assert_eq!(total.max, [1.0, 3.0, 1.0]);
    }
}
