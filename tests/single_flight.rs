// Concurrent mesh retrieval must read and decode each object exactly once.
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use byteorder::{LittleEndian, WriteBytesExt};
use serde_json::json;

use meshjoin::{DecodedMesh, MeshCodec, PrimitiveKind, Tile};

/// JSON codec that counts how many times decode actually runs.
struct CountingCodec {
    decodes: Arc<AtomicUsize>,
}

struct JsonMesh {
    voxels: usize,
    lods: HashMap<u32, Vec<Vec<f32>>>,
}

impl MeshCodec for CountingCodec {
    fn decode(&self, data: &[u8]) -> Result<Box<dyn DecodedMesh>, anyhow::Error> {
        self.decodes.fetch_add(1, Ordering::SeqCst);
        let value: serde_json::Value = serde_json::from_slice(data)?;
        let voxels = value["voxels"].as_u64().unwrap_or(0) as usize;
        let mut lods = HashMap::new();
        if let Some(map) = value["lods"].as_object() {
            for (lod, buffers) in map {
                let parsed: Vec<Vec<f32>> = serde_json::from_value(buffers.clone())?;
                lods.insert(lod.parse::<u32>()?, parsed);
            }
        }
        Ok(Box::new(JsonMesh { voxels, lods }))
    }
}

impl DecodedMesh for JsonMesh {
    fn advance_to(&mut self, _lod: u32) {}

    fn voxel_primitives(&self, lod: u32, _kind: PrimitiveKind) -> Vec<Vec<f32>> {
        match self.lods.get(&lod) {
            Some(buffers) => buffers.clone(),
            None => vec![Vec::new(); self.voxels],
        }
    }
}

fn one_object_raw() -> Vec<u8> {
    let mesh = json!({"voxels": 1, "lods": {"0": [[0.0, 0.0, 0.0, 0.0, 1.0, 0.0]]}});
    let bytes = serde_json::to_vec(&mesh).unwrap();
    let mut out = Vec::new();
    out.write_u64::<LittleEndian>(bytes.len() as u64).unwrap();
    out.extend_from_slice(&bytes);
    out.write_u64::<LittleEndian>(1).unwrap();
    let min = [0.0f32, 0.0, 0.0];
    let max = [1.0f32, 1.0, 1.0];
    let core = [0.5f32, 0.5, 0.5];
    for v in min.iter().chain(max.iter()).chain(core.iter()) {
        out.write_f32::<LittleEndian>(*v).unwrap();
    }
    out
}

#[test]
fn test_concurrent_retrieve_is_single_flight() {
    let decodes = Arc::new(AtomicUsize::new(0));
    let codec = Arc::new(CountingCodec {
        decodes: Arc::clone(&decodes),
    });
    let tile = Tile::from_raw(one_object_raw(), codec).unwrap();

    thread::scope(|scope| {
        for _ in 0..16 {
            scope.spawn(|| {
                tile.retrieve_mesh(0).expect("retrieval must succeed");
                assert!(tile.get_mesh_wrapper(0).has_mesh());
            });
        }
    });

    assert_eq!(tile.stats().disk_reads(), 1, "exactly one read of the tile source");
    assert_eq!(decodes.load(Ordering::SeqCst), 1, "exactly one mesh construction");
    assert_eq!(tile.stats().mesh_decodes(), 1);
}

#[test]
fn test_reset_allows_a_fresh_flight() {
    let decodes = Arc::new(AtomicUsize::new(0));
    let codec = Arc::new(CountingCodec {
        decodes: Arc::clone(&decodes),
    });
    let tile = Tile::from_raw(one_object_raw(), codec).unwrap();

    tile.retrieve_mesh(0).unwrap();
    tile.get_mesh_wrapper(0).reset();
    tile.retrieve_mesh(0).unwrap();

    assert_eq!(tile.stats().disk_reads(), 2);
    assert_eq!(decodes.load(Ordering::SeqCst), 2);
}
