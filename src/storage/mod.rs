//! Tile storage and the mesh cache
//!
//! Tiles own the compressed polyhedra of one file plus their lightweight
//! voxel metadata; meshes are decoded lazily and on demand during a join.
//!
//! # Submodules
//! - `mesh` - The consumed codec contract (bytes to per-voxel primitives)
//! - `tile` - Tile loading, the per-object mesh cache, voxel buffers

mod mesh;
mod tile;

pub use mesh::{DecodedMesh, MeshCodec, PrimitiveKind};
pub use tile::{MeshWrapper, Tile, TileEntry, TileStats, Voxel};
