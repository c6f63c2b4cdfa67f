//! Tile loading and the lazy mesh cache
//!
//! A tile file carries, per object, the compressed mesh bytes followed by
//! the voxel metadata. The voxel metadata is mirrored into a little-endian
//! sidecar (`.mt`) next to the tile on first open so later opens skip the
//! full scan. Meshes are decoded on demand during a join and dropped again
//! between LOD rounds; only the AABB metadata stays resident.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Cursor, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rstar::{RTree, RTreeObject, AABB};

use crate::geometry::Aabb;

use super::mesh::{DecodedMesh, MeshCodec, PrimitiveKind};

/// A sub-region of a polyhedron: a tight bounding box plus a
/// representative point. Primitive buffers live in the owning wrapper.
#[derive(Clone, Debug)]
pub struct Voxel {
    pub bounds: Aabb,
    pub core: [f32; 3],
}

struct WrapperState {
    mesh: Option<Box<dyn DecodedMesh>>,
    kind: Option<PrimitiveKind>,
    /// Per-voxel flat primitive buffers, keyed by LOD.
    data: Vec<HashMap<u32, Vec<f32>>>,
    /// Per-voxel primitive counts, keyed by LOD.
    sizes: Vec<HashMap<u32, usize>>,
}

/// One polyhedron of a tile: object-level AABB, voxel metadata, and the
/// lock-protected decode state.
pub struct MeshWrapper {
    pub id: usize,
    pub bounds: Aabb,
    pub voxels: Vec<Voxel>,
    data_offset: u64,
    data_size: u64,
    state: Mutex<WrapperState>,
}

impl MeshWrapper {
    fn new(id: usize, data_offset: u64, data_size: u64, voxels: Vec<Voxel>) -> Self {
        let mut bounds = Aabb::empty();
        for v in &voxels {
            bounds.update(&v.bounds);
        }
        let n = voxels.len();
        Self {
            id,
            bounds,
            voxels,
            data_offset,
            data_size,
            state: Mutex::new(WrapperState {
                mesh: None,
                kind: None,
                data: vec![HashMap::new(); n],
                sizes: vec![HashMap::new(); n],
            }),
        }
    }

    pub fn has_mesh(&self) -> bool {
        self.state.lock().unwrap().mesh.is_some()
    }

    /// Decode the mesh further so primitives up to `lod` are available.
    pub fn advance_to(&self, lod: u32) -> Result<(), anyhow::Error> {
        let mut state = self.state.lock().unwrap();
        match state.mesh.as_mut() {
            Some(mesh) => {
                mesh.advance_to(lod);
                Ok(())
            }
            None => Err(anyhow::anyhow!(
                "object {} has no decoded mesh to advance",
                self.id
            )),
        }
    }

    /// Populate every voxel's primitive buffer at `lod` from the decoded
    /// mesh. Idempotent per LOD; switching primitive kind drops buffers of
    /// the previous kind.
    pub fn fill_voxels(&self, lod: u32, kind: PrimitiveKind) -> Result<(), anyhow::Error> {
        let mut state = self.state.lock().unwrap();
        if state.kind != Some(kind) {
            for m in &mut state.data {
                m.clear();
            }
            for m in &mut state.sizes {
                m.clear();
            }
            state.kind = Some(kind);
        }
        if self.voxels.is_empty() || state.data[0].contains_key(&lod) {
            return Ok(());
        }
        let mesh = state
            .mesh
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("object {} has no decoded mesh to fill from", self.id))?;
        mesh.advance_to(lod);
        let buffers = mesh.voxel_primitives(lod, kind);
        if buffers.len() != self.voxels.len() {
            return Err(anyhow::anyhow!(
                "codec returned {} voxel buffers for object {} with {} voxels",
                buffers.len(),
                self.id,
                self.voxels.len()
            ));
        }
        let stride = kind.stride();
        for (i, buf) in buffers.into_iter().enumerate() {
            debug_assert_eq!(buf.len() % stride, 0);
            state.sizes[i].insert(lod, buf.len() / stride);
            state.data[i].insert(lod, buf);
        }
        Ok(())
    }

    /// Whether `data[lod]` is populated for the voxel.
    pub fn has_voxel_data(&self, vox: usize, lod: u32) -> bool {
        self.state.lock().unwrap().data[vox].contains_key(&lod)
    }

    /// Primitive count of the voxel at `lod`; 0 when unfilled.
    pub fn voxel_size(&self, vox: usize, lod: u32) -> usize {
        self.state.lock().unwrap().sizes[vox]
            .get(&lod)
            .copied()
            .unwrap_or(0)
    }

    /// Copy the voxel's flat buffer at `lod` into `out`, which must hold
    /// exactly `voxel_size(vox, lod) * stride` floats.
    pub fn copy_voxel_data(&self, vox: usize, lod: u32, out: &mut [f32]) {
        let state = self.state.lock().unwrap();
        if let Some(buf) = state.data[vox].get(&lod) {
            debug_assert_eq!(out.len(), buf.len());
            out[..buf.len()].copy_from_slice(buf);
        }
    }

    /// Drop the decoded mesh and every per-LOD buffer; AABB metadata stays.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.mesh = None;
        state.kind = None;
        for m in &mut state.data {
            m.clear();
        }
        for m in &mut state.sizes {
            m.clear();
        }
    }
}

/// Object MBB entry of the tile's R-tree.
pub struct TileEntry {
    pub id: usize,
    envelope: AABB<[f32; 3]>,
}

impl RTreeObject for TileEntry {
    type Envelope = AABB<[f32; 3]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

/// I/O counters for one tile.
#[derive(Default)]
pub struct TileStats {
    disk_reads: AtomicUsize,
    mesh_decodes: AtomicUsize,
}

impl TileStats {
    pub fn disk_reads(&self) -> usize {
        self.disk_reads.load(Ordering::Relaxed)
    }

    pub fn mesh_decodes(&self) -> usize {
        self.mesh_decodes.load(Ordering::Relaxed)
    }
}

enum TileSource {
    File(File),
    Memory(Vec<u8>),
}

impl TileSource {
    fn read_range(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, anyhow::Error> {
        match self {
            TileSource::File(file) => {
                let mut buf = vec![0u8; len];
                file.seek(SeekFrom::Start(offset))?;
                file.read_exact(&mut buf)?;
                Ok(buf)
            }
            TileSource::Memory(data) => {
                let start = offset as usize;
                let end = start
                    .checked_add(len)
                    .filter(|&e| e <= data.len())
                    .ok_or_else(|| {
                        anyhow::anyhow!("mesh data range {offset}+{len} outside tile buffer")
                    })?;
                Ok(data[start..end].to_vec())
            }
        }
    }
}

/// A collection of polyhedra loaded from one file plus their metadata.
pub struct Tile {
    objects: Vec<MeshWrapper>,
    bounds: Aabb,
    source: Mutex<TileSource>,
    codec: Arc<dyn MeshCodec>,
    stats: TileStats,
    index: OnceLock<RTree<TileEntry>>,
}

impl Tile {
    /// Open a tile file, loading the `.mt` metadata sidecar when present
    /// and building (then persisting) it from the raw stream otherwise.
    /// At most `capacity` objects are loaded.
    pub fn open(
        path: impl AsRef<Path>,
        codec: Arc<dyn MeshCodec>,
        capacity: usize,
    ) -> Result<Self, anyhow::Error> {
        let path = path.as_ref();
        let start = Instant::now();
        let file = File::open(path)
            .map_err(|e| anyhow::anyhow!("{} can not be opened: {e}", path.display()))?;

        let meta_path = path.with_extension("mt");
        let (objects, bounds) = if meta_path.exists() {
            let meta = File::open(&meta_path)
                .map_err(|e| anyhow::anyhow!("{} can not be opened: {e}", meta_path.display()))?;
            load_sidecar(&mut BufReader::new(meta), capacity)?
        } else {
            let parsed = parse_raw(&mut BufReader::new(&file), capacity)?;
            persist_sidecar(&meta_path, &parsed.0)?;
            parsed
        };

        eprintln!(
            "[Tile] loaded {} polyhedra from {} in {:?}",
            objects.len(),
            path.display(),
            start.elapsed()
        );
        Ok(Self {
            objects,
            bounds,
            source: Mutex::new(TileSource::File(file)),
            codec,
            stats: TileStats::default(),
            index: OnceLock::new(),
        })
    }

    /// Build a tile from an in-memory raw stream in the tile-file layout.
    pub fn from_raw(data: Vec<u8>, codec: Arc<dyn MeshCodec>) -> Result<Self, anyhow::Error> {
        let (objects, bounds) = parse_raw(&mut Cursor::new(&data), usize::MAX)?;
        Ok(Self {
            objects,
            bounds,
            source: Mutex::new(TileSource::Memory(data)),
            codec,
            stats: TileStats::default(),
            index: OnceLock::new(),
        })
    }

    pub fn num_objects(&self) -> usize {
        self.objects.len()
    }

    pub fn bounds(&self) -> &Aabb {
        &self.bounds
    }

    pub fn stats(&self) -> &TileStats {
        &self.stats
    }

    pub fn get_mesh_wrapper(&self, id: usize) -> &MeshWrapper {
        &self.objects[id]
    }

    /// Ensure the compressed mesh for `id` is decoded in memory.
    ///
    /// Single-flight: the per-object lock is held across the whole check,
    /// read, and decode, so concurrent callers perform exactly one disk
    /// read and one decode. The tile-wide source lock is only held for
    /// the read itself.
    pub fn retrieve_mesh(&self, id: usize) -> Result<(), anyhow::Error> {
        let wrapper = &self.objects[id];
        let mut state = wrapper.state.lock().unwrap();
        if state.mesh.is_some() {
            return Ok(());
        }
        let raw = {
            let mut source = self.source.lock().unwrap();
            self.stats.disk_reads.fetch_add(1, Ordering::Relaxed);
            source.read_range(wrapper.data_offset, wrapper.data_size as usize)?
        };
        state.mesh = Some(self.codec.decode(&raw)?);
        self.stats.mesh_decodes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Retrieve and decode the mesh for `id` up to `lod`.
    pub fn decode_to(&self, id: usize, lod: u32) -> Result<(), anyhow::Error> {
        self.retrieve_mesh(id)?;
        self.objects[id].advance_to(lod)
    }

    pub fn retrieve_all(&self) -> Result<(), anyhow::Error> {
        for w in &self.objects {
            self.retrieve_mesh(w.id)?;
        }
        Ok(())
    }

    pub fn advance_all(&self, lod: u32) -> Result<(), anyhow::Error> {
        for w in &self.objects {
            self.decode_to(w.id, lod)?;
        }
        Ok(())
    }

    /// R-tree over the object MBBs, built on first use.
    pub fn spatial_index(&self) -> &RTree<TileEntry> {
        self.index.get_or_init(|| {
            let entries = self
                .objects
                .iter()
                .map(|w| TileEntry {
                    id: w.id,
                    envelope: AABB::from_corners(w.bounds.min, w.bounds.max),
                })
                .collect();
            RTree::bulk_load(entries)
        })
    }
}

fn read_voxels<R: Read>(reader: &mut R, count: usize) -> Result<Vec<Voxel>, anyhow::Error> {
    let mut voxels = Vec::with_capacity(count);
    for _ in 0..count {
        let mut min = [0.0f32; 3];
        let mut max = [0.0f32; 3];
        let mut core = [0.0f32; 3];
        for v in min.iter_mut().chain(max.iter_mut()).chain(core.iter_mut()) {
            *v = reader.read_f32::<LittleEndian>()?;
        }
        voxels.push(Voxel {
            bounds: Aabb::new(min, max),
            core,
        });
    }
    Ok(voxels)
}

/// Scan the raw tile stream: per object, `data_size: u64`, the mesh
/// bytes, `n_voxels: u64`, then 9 floats per voxel.
fn parse_raw<R: Read + Seek>(
    reader: &mut R,
    capacity: usize,
) -> Result<(Vec<MeshWrapper>, Aabb), anyhow::Error> {
    let mut objects = Vec::new();
    let mut bounds = Aabb::empty();
    while objects.len() < capacity {
        let data_size = match reader.read_u64::<LittleEndian>() {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        };
        let data_offset = reader.stream_position()?;
        reader.seek(SeekFrom::Current(data_size as i64))?;
        let n_voxels = reader.read_u64::<LittleEndian>()? as usize;
        let voxels = read_voxels(reader, n_voxels)?;
        let wrapper = MeshWrapper::new(objects.len(), data_offset, data_size, voxels);
        bounds.update(&wrapper.bounds);
        objects.push(wrapper);
    }
    Ok((objects, bounds))
}

/// Load the metadata sidecar: per object, `data_offset: u64`,
/// `data_size: u64`, `n_voxels: u64`, then 9 floats per voxel.
fn load_sidecar<R: Read>(
    reader: &mut R,
    capacity: usize,
) -> Result<(Vec<MeshWrapper>, Aabb), anyhow::Error> {
    let mut objects = Vec::new();
    let mut bounds = Aabb::empty();
    while objects.len() < capacity {
        let data_offset = match reader.read_u64::<LittleEndian>() {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        };
        let data_size = reader.read_u64::<LittleEndian>()?;
        let n_voxels = reader.read_u64::<LittleEndian>()? as usize;
        let voxels = read_voxels(reader, n_voxels)?;
        let wrapper = MeshWrapper::new(objects.len(), data_offset, data_size, voxels);
        bounds.update(&wrapper.bounds);
        objects.push(wrapper);
    }
    Ok((objects, bounds))
}

fn persist_sidecar(path: &Path, objects: &[MeshWrapper]) -> Result<(), anyhow::Error> {
    let file = File::create(path)
        .map_err(|e| anyhow::anyhow!("{} can not be created: {e}", path.display()))?;
    let mut writer = BufWriter::new(file);
    for w in objects {
        writer.write_u64::<LittleEndian>(w.data_offset)?;
        writer.write_u64::<LittleEndian>(w.data_size)?;
        writer.write_u64::<LittleEndian>(w.voxels.len() as u64)?;
        for v in &w.voxels {
            for x in v.bounds.min.iter().chain(v.bounds.max.iter()).chain(v.core.iter()) {
                writer.write_f32::<LittleEndian>(*x)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Codec for tests: mesh bytes are JSON `{"voxels": n, "lods":
    /// {"<lod>": [[floats per voxel], ...]}}`.
    struct JsonCodec;

    struct JsonMesh {
        voxels: usize,
        lods: HashMap<u32, Vec<Vec<f32>>>,
    }

    impl MeshCodec for JsonCodec {
        fn decode(&self, data: &[u8]) -> Result<Box<dyn DecodedMesh>, anyhow::Error> {
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

    fn voxel_floats(min: [f32; 3], max: [f32; 3]) -> ([f32; 3], [f32; 3], [f32; 3]) {
        let core = [
            (min[0] + max[0]) / 2.0,
            (min[1] + max[1]) / 2.0,
            (min[2] + max[2]) / 2.0,
        ];
        (min, max, core)
    }

    fn raw_object(mesh: &serde_json::Value, voxels: &[([f32; 3], [f32; 3], [f32; 3])]) -> Vec<u8> {
        let bytes = serde_json::to_vec(mesh).unwrap();
        let mut out = Vec::new();
        out.write_u64::<LittleEndian>(bytes.len() as u64).unwrap();
        out.extend_from_slice(&bytes);
        out.write_u64::<LittleEndian>(voxels.len() as u64).unwrap();
        for (min, max, core) in voxels {
            for v in min.iter().chain(max.iter()).chain(core.iter()) {
                out.write_f32::<LittleEndian>(*v).unwrap();
            }
        }
        out
    }

    fn two_object_raw() -> Vec<u8> {
        let seg = |x: f32| json!([[x, 0.0, 0.0, x, 1.0, 0.0]]);
        let mut raw = raw_object(
            &json!({"voxels": 1, "lods": {"0": seg(0.0)}}),
            &[voxel_floats([0.0, 0.0, 0.0], [1.0, 1.0, 1.0])],
        );
        raw.extend(raw_object(
            &json!({"voxels": 1, "lods": {"0": seg(5.0)}}),
            &[voxel_floats([5.0, 0.0, 0.0], [6.0, 1.0, 1.0])],
        ));
        raw
    }

    #[test]
    fn test_from_raw_parses_objects_and_bounds() {
        let tile = Tile::from_raw(two_object_raw(), Arc::new(JsonCodec)).unwrap();
        assert_eq!(tile.num_objects(), 2);
        assert_eq!(tile.get_mesh_wrapper(0).voxels.len(), 1);
        assert_eq!(tile.bounds().min, [0.0, 0.0, 0.0]);
        assert_eq!(tile.bounds().max, [6.0, 1.0, 1.0]);
        let w = tile.get_mesh_wrapper(1);
        assert_eq!(w.bounds.min, [5.0, 0.0, 0.0]);
    }

    #[test]
    fn test_retrieve_fill_and_reset() {
        let tile = Tile::from_raw(two_object_raw(), Arc::new(JsonCodec)).unwrap();
        let w = tile.get_mesh_wrapper(0);
        assert!(!w.has_mesh());

        tile.decode_to(0, 0).unwrap();
        assert!(w.has_mesh());
        assert_eq!(tile.stats().disk_reads(), 1);

        // repeated retrieval hits the cache
        tile.retrieve_mesh(0).unwrap();
        assert_eq!(tile.stats().disk_reads(), 1);
        assert_eq!(tile.stats().mesh_decodes(), 1);

        w.fill_voxels(0, PrimitiveKind::Segments).unwrap();
        assert!(w.has_voxel_data(0, 0));
        assert_eq!(w.voxel_size(0, 0), 1);
        let mut out = vec![0.0f32; 6];
        w.copy_voxel_data(0, 0, &mut out);
        assert_eq!(out, vec![0.0, 0.0, 0.0, 0.0, 1.0, 0.0]);

        w.reset();
        assert!(!w.has_mesh());
        assert!(!w.has_voxel_data(0, 0));
        assert_eq!(w.voxel_size(0, 0), 0);

        // next round reads again
        tile.retrieve_mesh(0).unwrap();
        assert_eq!(tile.stats().disk_reads(), 2);
    }

    #[test]
    fn test_missing_lod_fills_empty_buffers() {
        let tile = Tile::from_raw(two_object_raw(), Arc::new(JsonCodec)).unwrap();
        let w = tile.get_mesh_wrapper(0);
        tile.decode_to(0, 50).unwrap();
        w.fill_voxels(50, PrimitiveKind::Segments).unwrap();
        assert!(w.has_voxel_data(0, 50));
        assert_eq!(w.voxel_size(0, 50), 0);
    }

    #[test]
    fn test_open_persists_and_reuses_sidecar() {
        let dir = std::env::temp_dir().join(format!("meshjoin_tile_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let dt_path = dir.join("sample.dt");
        std::fs::write(&dt_path, two_object_raw()).unwrap();

        let tile = Tile::open(&dt_path, Arc::new(JsonCodec), usize::MAX).unwrap();
        assert_eq!(tile.num_objects(), 2);
        let meta_path = dt_path.with_extension("mt");
        assert!(meta_path.exists(), "first open must persist the sidecar");

        // second open goes through the sidecar and sees the same metadata
        let reopened = Tile::open(&dt_path, Arc::new(JsonCodec), usize::MAX).unwrap();
        assert_eq!(reopened.num_objects(), 2);
        assert_eq!(reopened.bounds(), tile.bounds());
        reopened.decode_to(1, 0).unwrap();
        let w = reopened.get_mesh_wrapper(1);
        w.fill_voxels(0, PrimitiveKind::Segments).unwrap();
        assert_eq!(w.voxel_size(0, 0), 1);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_capacity_limits_objects() {
        let tile_raw = two_object_raw();
        let (objects, _) = parse_raw(&mut Cursor::new(&tile_raw), 1).unwrap();
        assert_eq!(objects.len(), 1);
    }

    #[test]
    fn test_spatial_index_queries() {
        let tile = Tile::from_raw(two_object_raw(), Arc::new(JsonCodec)).unwrap();
        let index = tile.spatial_index();
        let near: Vec<usize> = index
            .locate_in_envelope_intersecting(&AABB::from_corners([0.5, 0.5, 0.5], [0.6, 0.6, 0.6]))
            .map(|e| e.id)
            .collect();
        assert_eq!(near, vec![0]);
        let all: Vec<usize> = index
            .locate_in_envelope_intersecting(&AABB::from_corners([-1.0, -1.0, -1.0], [10.0, 2.0, 2.0]))
            .map(|e| e.id)
            .collect();
        assert_eq!(all.len(), 2);
    }
}
