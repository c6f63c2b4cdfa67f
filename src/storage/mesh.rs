//! Mesh codec contract
//!
//! The decompression algorithm lives outside the engine; the join only
//! needs compressed bytes turned into per-voxel flat primitive buffers at
//! a requested level of detail.

/// Which primitive a voxel buffer carries, and how many floats one
/// primitive occupies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrimitiveKind {
    /// Two endpoints, 6 floats.
    Segments,
    /// Three vertices, 9 floats.
    Triangles,
}

impl PrimitiveKind {
    pub fn stride(self) -> usize {
        match self {
            PrimitiveKind::Segments => 6,
            PrimitiveKind::Triangles => 9,
        }
    }
}

/// A progressively decodable mesh.
pub trait DecodedMesh: Send {
    /// Decode further so primitives up to `lod` are available. Repeated
    /// calls at the same level must be no-ops.
    fn advance_to(&mut self, lod: u32);

    /// Flat primitive buffers at `lod`, one per voxel of the owning
    /// object, in voxel order. The codec supplies the primitive-to-voxel
    /// assignment; each buffer length is a multiple of `kind.stride()`.
    fn voxel_primitives(&self, lod: u32, kind: PrimitiveKind) -> Vec<Vec<f32>>;
}

/// Turns an object's compressed bytes into a [`DecodedMesh`].
pub trait MeshCodec: Send + Sync {
    fn decode(&self, data: &[u8]) -> Result<Box<dyn DecodedMesh>, anyhow::Error>;
}
