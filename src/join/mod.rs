//! The progressive spatial join
//!
//! Seeds candidate pairs from bounding boxes, then refines them over
//! increasing levels of detail: decode what the surviving pairs need,
//! batch the primitive comparisons, scatter the measurements back, and
//! prune. The loop ends when every reference object is resolved or the
//! top LOD has been used.
//!
//! # Submodules
//! - `config` - LOD schedule and resource knobs
//! - `candidate` - Candidate structures and elimination rules
//! - `nearest` - Nearest-neighbor join driver
//! - `intersect` - Intersection join driver

mod candidate;
mod config;
mod intersect;
mod nearest;

pub use candidate::{
    update_candidate_list,
    update_voxel_pair_list,
    DistanceCandidate,
    IntersectCandidate,
    IntersectPair,
    VoxelPair,
};
pub use config::JoinConfig;
pub use intersect::IntersectResult;
pub use nearest::NearestNeighbor;

use std::sync::Arc;

use crate::compute::{GeometryComputer, ResourceBroker};

/// Drives the progressive-refinement joins over two tiles.
pub struct SpatialJoin {
    computer: Arc<GeometryComputer>,
    config: JoinConfig,
}

impl SpatialJoin {
    pub fn new(computer: Arc<GeometryComputer>, config: JoinConfig) -> Result<Self, anyhow::Error> {
        config.validate()?;
        Ok(Self { computer, config })
    }

    /// Build a join with its own CPU-only computer sized from the config.
    pub fn with_config(config: JoinConfig) -> Result<Self, anyhow::Error> {
        let computer = GeometryComputer::new(ResourceBroker::new(), config.num_threads);
        Self::new(Arc::new(computer), config)
    }

    pub fn config(&self) -> &JoinConfig {
        &self.config
    }
}

/// Key of one voxel in the packing map. Sides collapse for self-joins so
/// a voxel reached from both walks packs exactly once.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct VoxelKey {
    pub(crate) side: u8,
    pub(crate) obj: usize,
    pub(crate) vox: usize,
}

impl VoxelKey {
    pub(crate) fn new(side: u8, obj: usize, vox: usize, same_tile: bool) -> Self {
        Self {
            side: if same_tile { 0 } else { side },
            obj,
            vox,
        }
    }
}
