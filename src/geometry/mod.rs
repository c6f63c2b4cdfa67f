//! Geometric primitives for the spatial join
//!
//! This module provides the bounding-volume types and the low-level
//! distance/intersection kernels that the join drivers dispatch in batches.
//!
//! # Submodules
//! - `aabb` - Axis-aligned bounding boxes and interval-valued distance ranges
//! - `distance` - Segment and triangle distance/intersection primitives
//! - `batch` - Batched kernels over flat primitive buffers

mod aabb;
mod batch;
mod distance;

pub use aabb::{Aabb, DistanceRange};

pub use distance::{
    closest_segment_points,
    segments_distance,
    triangle_distance,
    triangles_intersect,
    triangles_intersect_any,
};

pub use batch::{segments_distance_batch, triangles_intersect_batch};
