//! Intersection join driver
//!
//! Candidates come from the probed tile's R-tree over object MBBs; voxel
//! pairs with overlapping boxes are then proven (or not) by batched
//! triangle intersection tests at increasing LOD. An object is resolved
//! the moment any of its voxel pairs is known intersecting.

use std::time::Instant;

use indexmap::IndexMap;
use rayon::prelude::*;
use rstar::AABB;
use serde::Serialize;

use crate::storage::{PrimitiveKind, Tile};

use super::candidate::{intersect_pair_count, CandidateEntry, IntersectCandidate, IntersectPair};
use super::{SpatialJoin, VoxelKey};

/// Per-object outcome of the intersection join.
#[derive(Clone, Debug, Serialize)]
pub struct IntersectResult {
    /// Reference object id within the first tile.
    pub object: usize,
    /// Whether any probed object intersects it.
    pub intersecting: bool,
}

impl SpatialJoin {
    /// Intersection join: each object of `tile1` against the objects of
    /// `tile2`. Passing the same tile twice skips self-comparison.
    pub fn intersect(
        &self,
        tile1: &Tile,
        tile2: &Tile,
    ) -> Result<Vec<IntersectResult>, anyhow::Error> {
        let start = Instant::now();
        let same_tile = std::ptr::eq(tile1, tile2);
        let rtree = tile2.spatial_index();

        // filter with MBBs through the R-tree
        let mut candidates: Vec<CandidateEntry<IntersectCandidate>> = (0..tile1.num_objects())
            .into_par_iter()
            .map(|i| {
                let w1 = tile1.get_mesh_wrapper(i);
                let envelope = AABB::from_corners(w1.bounds.min, w1.bounds.max);
                let mut list = Vec::new();
                for entry in rtree.locate_in_envelope_intersecting(&envelope) {
                    let j = entry.id;
                    if same_tile && i == j {
                        continue;
                    }
                    let w2 = tile2.get_mesh_wrapper(j);
                    if !w1.bounds.intersects(&w2.bounds) {
                        continue;
                    }
                    let mut ci = IntersectCandidate {
                        other: j,
                        voxel_pairs: Vec::new(),
                    };
                    for (vi, v1) in w1.voxels.iter().enumerate() {
                        for (vj, v2) in w2.voxels.iter().enumerate() {
                            if v1.bounds.intersects(&v2.bounds) {
                                ci.voxel_pairs.push(IntersectPair {
                                    v1: vi,
                                    v2: vj,
                                    intersecting: false,
                                });
                            }
                        }
                    }
                    if !ci.voxel_pairs.is_empty() {
                        list.push(ci);
                    }
                }
                (i, list)
            })
            .collect();
        eprintln!(
            "[Join] intersect: {} objects with {} voxel pairs after MBB filtering in {:?}",
            candidates.len(),
            intersect_pair_count(&candidates),
            start.elapsed()
        );

        let mut results = Vec::new();
        for lod in self.config.lods() {
            let round = Instant::now();
            resolve_intersections(&mut candidates, &mut results);
            let pair_num = intersect_pair_count(&candidates);
            if pair_num == 0 {
                break;
            }

            // decode phase
            let mut voxel_map: IndexMap<VoxelKey, (u32, u32)> = IndexMap::new();
            let mut triangle_num = 0usize;
            for (obj, list) in &candidates {
                let w1 = tile1.get_mesh_wrapper(*obj);
                for info in list {
                    let w2 = tile2.get_mesh_wrapper(info.other);
                    for vp in &info.voxel_pairs {
                        if !w1.has_voxel_data(vp.v1, lod) {
                            tile1.decode_to(*obj, lod)?;
                            w1.fill_voxels(lod, PrimitiveKind::Triangles)?;
                        }
                        if !w2.has_voxel_data(vp.v2, lod) {
                            tile2.decode_to(info.other, lod)?;
                            w2.fill_voxels(lod, PrimitiveKind::Triangles)?;
                        }
                        for (side, owner, vox, w) in
                            [(0u8, *obj, vp.v1, w1), (1u8, info.other, vp.v2, w2)]
                        {
                            let key = VoxelKey::new(side, owner, vox, same_tile);
                            voxel_map.entry(key).or_insert_with(|| {
                                let n = w.voxel_size(vox, lod);
                                let off = triangle_num;
                                triangle_num += n;
                                (off as u32, n as u32)
                            });
                        }
                    }
                }
            }
            eprintln!(
                "[Join] lod {lod}: {pair_num} voxel pairs over {} voxels with {triangle_num} triangles",
                voxel_map.len()
            );

            // pack phase, mirroring the decode walk
            let mut data = vec![0.0f32; 9 * triangle_num];
            for (key, (off, n)) in &voxel_map {
                let tile = if key.side == 0 { tile1 } else { tile2 };
                let w = tile.get_mesh_wrapper(key.obj);
                let s = *off as usize * 9;
                w.copy_voxel_data(key.vox, lod, &mut data[s..s + *n as usize * 9]);
            }
            let mut offset_size = vec![0u32; 4 * pair_num];
            let mut index = 0;
            for (obj, list) in &candidates {
                for info in list {
                    for vp in &info.voxel_pairs {
                        let (o1, n1) = voxel_map[&VoxelKey::new(0, *obj, vp.v1, same_tile)];
                        let (o2, n2) = voxel_map[&VoxelKey::new(1, info.other, vp.v2, same_tile)];
                        offset_size[4 * index] = o1;
                        offset_size[4 * index + 1] = n1;
                        offset_size[4 * index + 2] = o2;
                        offset_size[4 * index + 3] = n2;
                        index += 1;
                    }
                }
            }
            debug_assert_eq!(index, pair_num);

            // compute phase, CPU only
            let mut flags = vec![false; pair_num];
            self.computer.get_intersect(&data, &offset_size, &mut flags);

            // scatter phase: a pair once proven intersecting stays so
            let mut index = 0;
            for (_, list) in &mut candidates {
                for info in list.iter_mut() {
                    for vp in info.voxel_pairs.iter_mut() {
                        vp.intersecting |= flags[index];
                        index += 1;
                    }
                }
            }

            release_voxels(&candidates, tile1, tile2);
            eprintln!("[Join] lod {lod} finished in {:?}", round.elapsed());
        }

        // harvest the last round; whatever survived the top LOD without a
        // proven pair does not intersect
        resolve_intersections(&mut candidates, &mut results);
        for (obj, _) in candidates.drain(..) {
            results.push(IntersectResult {
                object: obj,
                intersecting: false,
            });
        }
        results.sort_by_key(|r| r.object);
        eprintln!(
            "[Join] intersect: {} results in {:?}",
            results.len(),
            start.elapsed()
        );
        Ok(results)
    }
}

/// Report objects with a proven voxel pair as intersecting and objects
/// with no candidates left as non-intersecting; both leave the loop.
fn resolve_intersections(
    candidates: &mut Vec<CandidateEntry<IntersectCandidate>>,
    results: &mut Vec<IntersectResult>,
) {
    candidates.retain(|(obj, list)| {
        let intersected = list
            .iter()
            .any(|c| c.voxel_pairs.iter().any(|vp| vp.intersecting));
        if intersected {
            results.push(IntersectResult {
                object: *obj,
                intersecting: true,
            });
            false
        } else if list.is_empty() {
            results.push(IntersectResult {
                object: *obj,
                intersecting: false,
            });
            false
        } else {
            true
        }
    });
}

fn release_voxels(
    candidates: &[CandidateEntry<IntersectCandidate>],
    tile1: &Tile,
    tile2: &Tile,
) {
    for (obj, list) in candidates {
        tile1.get_mesh_wrapper(*obj).reset();
        for info in list {
            tile2.get_mesh_wrapper(info.other).reset();
        }
    }
}
