// Module declarations
pub mod compute;
pub mod geometry;
pub mod join;
pub mod storage;

// Re-export commonly used types and functions
pub use compute::{Accelerator, GeometryComputer, ResourceBroker};
pub use geometry::{Aabb, DistanceRange};
pub use join::{IntersectResult, JoinConfig, NearestNeighbor, SpatialJoin};
pub use storage::{DecodedMesh, MeshCodec, MeshWrapper, PrimitiveKind, Tile, Voxel};
