//! Candidate structures and the elimination rules
//!
//! A candidate records that an object pair has not yet been proven
//! non-optimal, carrying a distance interval and the voxel pairs that
//! still need evaluation. The two update functions below are the whole
//! pruning logic: they decide whether a prospective range may enter a
//! list, evicting anything it strictly dominates on the way. The
//! surviving set does not depend on the order ranges arrive in.

use crate::geometry::DistanceRange;

/// A voxel pair under evaluation for the distance join. Indices address
/// the voxel lists of the reference object and the candidate object.
#[derive(Clone, Debug)]
pub struct VoxelPair {
    pub v1: usize,
    pub v2: usize,
    pub dist: DistanceRange,
}

/// One not-yet-eliminated neighbor of a reference object.
#[derive(Clone, Debug)]
pub struct DistanceCandidate {
    /// Object id within the probed tile.
    pub other: usize,
    pub distance: DistanceRange,
    pub voxel_pairs: Vec<VoxelPair>,
}

impl DistanceCandidate {
    /// Re-derive the candidate interval from its voxel pairs: the true
    /// object distance is the minimum over pair distances, so both bounds
    /// are component-wise minima.
    pub fn refresh_distance(&mut self) {
        let mut closest = f32::MAX;
        let mut farthest = f32::MAX;
        for vp in &self.voxel_pairs {
            closest = closest.min(vp.dist.closest);
            farthest = farthest.min(vp.dist.farthest);
        }
        if !self.voxel_pairs.is_empty() {
            self.distance = DistanceRange::new(closest, farthest);
        }
    }
}

/// A voxel pair under evaluation for the intersection join.
#[derive(Clone, Debug)]
pub struct IntersectPair {
    pub v1: usize,
    pub v2: usize,
    pub intersecting: bool,
}

/// One candidate of the intersection join.
#[derive(Clone, Debug)]
pub struct IntersectCandidate {
    pub other: usize,
    pub voxel_pairs: Vec<IntersectPair>,
}

/// Per-reference-object candidate lists for one join run.
pub type CandidateEntry<C> = (usize, Vec<C>);

/// Decide whether a prospective voxel pair with interval `d` should be
/// kept. Pairs strictly dominated by `d` are evicted in place; if any
/// existing pair strictly dominates `d`, the list is untouched and the
/// pair is rejected.
pub fn update_voxel_pair_list(pairs: &mut Vec<VoxelPair>, d: &DistanceRange) -> bool {
    let mut j = 0;
    while j < pairs.len() {
        let cur = pairs[j].dist;
        if d.farther_than(&cur) {
            return false;
        } else if d.closer_than(&cur) {
            pairs.remove(j);
        } else {
            j += 1;
        }
    }
    true
}

/// Same rule one level up: a range strictly farther than any candidate is
/// rejected; candidates strictly farther than `d` are removed with their
/// voxel pairs; overlapping candidates are pruned pair by pair and
/// removed once empty.
pub fn update_candidate_list(list: &mut Vec<DistanceCandidate>, d: &DistanceRange) -> bool {
    let mut i = 0;
    while i < list.len() {
        if d.farther_than(&list[i].distance) {
            // a closer candidate exists, drop the newcomer
            return false;
        } else if d.closer_than(&list[i].distance) {
            // this candidate cannot be the nearest
            list.remove(i);
        } else {
            if !update_voxel_pair_list(&mut list[i].voxel_pairs, d) {
                return false;
            }
            if list[i].voxel_pairs.is_empty() {
                list.remove(i);
            } else {
                i += 1;
            }
        }
    }
    true
}

/// Total voxel pairs awaiting evaluation across all reference objects.
pub fn distance_pair_count(candidates: &[CandidateEntry<DistanceCandidate>]) -> usize {
    candidates
        .iter()
        .map(|(_, list)| list.iter().map(|c| c.voxel_pairs.len()).sum::<usize>())
        .sum()
}

pub fn intersect_pair_count(candidates: &[CandidateEntry<IntersectCandidate>]) -> usize {
    candidates
        .iter()
        .map(|(_, list)| list.iter().map(|c| c.voxel_pairs.len()).sum::<usize>())
        .sum()
}
