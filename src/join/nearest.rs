//! Nearest-neighbor join driver
//!
//! MBB filtering seeds interval-valued candidates; each LOD round decodes
//! the voxels the surviving pairs need, batches the segment distances,
//! tightens the intervals, and prunes. A reference object is resolved as
//! soon as a single candidate remains.

use std::time::Instant;

use indexmap::IndexMap;
use rayon::prelude::*;
use serde::Serialize;

use crate::geometry::DistanceRange;
use crate::storage::{PrimitiveKind, Tile};

use super::candidate::{
    distance_pair_count, update_candidate_list, update_voxel_pair_list, CandidateEntry,
    DistanceCandidate, VoxelPair,
};
use super::{SpatialJoin, VoxelKey};

/// A resolved nearest-neighbor pair.
#[derive(Clone, Debug, Serialize)]
pub struct NearestNeighbor {
    /// Reference object id within the first tile.
    pub object: usize,
    /// Its nearest neighbor within the second tile.
    pub neighbor: usize,
    /// Distance bounds at resolution time; zero-width after an exact
    /// top-LOD measurement.
    pub distance: DistanceRange,
}

impl SpatialJoin {
    /// Nearest-neighbor join: each object of `tile1` against the objects
    /// of `tile2`. Passing the same tile twice skips self-comparison.
    /// Objects whose candidate list empties out yield no record.
    pub fn nearest_neighbor(
        &self,
        tile1: &Tile,
        tile2: &Tile,
    ) -> Result<Vec<NearestNeighbor>, anyhow::Error> {
        let start = Instant::now();
        let same_tile = std::ptr::eq(tile1, tile2);

        // filter with MBBs to seed per-object candidate lists
        let mut candidates: Vec<CandidateEntry<DistanceCandidate>> = (0..tile1.num_objects())
            .into_par_iter()
            .map(|i| (i, seed_candidates(tile1, tile2, i, same_tile)))
            .collect();
        eprintln!(
            "[Join] nearest: {} objects with {} voxel pairs after MBB filtering in {:?}",
            candidates.len(),
            distance_pair_count(&candidates),
            start.elapsed()
        );

        let mut results = Vec::new();
        let top_lod = self.config.top_lod;
        for lod in self.config.lods() {
            let round = Instant::now();
            resolve_singletons(&mut candidates, &mut results);
            if candidates.is_empty() {
                break;
            }
            let pair_num = distance_pair_count(&candidates);

            // decode phase: pull in any voxel whose primitives at this
            // LOD are missing, assigning buffer offsets in first-seen
            // order
            let mut voxel_map: IndexMap<VoxelKey, (u32, u32)> = IndexMap::new();
            let mut segment_num = 0usize;
            for (obj, list) in &candidates {
                let w1 = tile1.get_mesh_wrapper(*obj);
                for info in list {
                    let w2 = tile2.get_mesh_wrapper(info.other);
                    for vp in &info.voxel_pairs {
                        if !w1.has_voxel_data(vp.v1, lod) {
                            tile1.decode_to(*obj, lod)?;
                            w1.fill_voxels(lod, PrimitiveKind::Segments)?;
                        }
                        if !w2.has_voxel_data(vp.v2, lod) {
                            tile2.decode_to(info.other, lod)?;
                            w2.fill_voxels(lod, PrimitiveKind::Segments)?;
                        }
                        for (side, owner, vox, w) in
                            [(0u8, *obj, vp.v1, w1), (1u8, info.other, vp.v2, w2)]
                        {
                            let key = VoxelKey::new(side, owner, vox, same_tile);
                            voxel_map.entry(key).or_insert_with(|| {
                                let n = w.voxel_size(vox, lod);
                                let off = segment_num;
                                segment_num += n;
                                (off as u32, n as u32)
                            });
                        }
                    }
                }
            }
            eprintln!(
                "[Join] lod {lod}: {pair_num} voxel pairs over {} voxels with {segment_num} segments",
                voxel_map.len()
            );
            if segment_num == 0 {
                release_voxels(&candidates, tile1, tile2);
                continue;
            }

            // pack phase: voxel buffers then per-pair descriptors; this
            // walk mirrors the decode walk exactly
            let mut data = vec![0.0f32; 6 * segment_num];
            for (key, (off, n)) in &voxel_map {
                let tile = if key.side == 0 { tile1 } else { tile2 };
                let w = tile.get_mesh_wrapper(key.obj);
                let s = *off as usize * 6;
                w.copy_voxel_data(key.vox, lod, &mut data[s..s + *n as usize * 6]);
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

            // compute phase
            let mut distances = vec![0.0f32; pair_num];
            if self.config.with_gpu {
                self.computer
                    .get_distance(&data, &offset_size, &mut distances)?;
            } else {
                self.computer
                    .get_distance_cpu(&data, &offset_size, &mut distances);
            }

            // scatter the measurements back and re-prune each list. Below
            // the top LOD a measurement only lowers the upper bound; at
            // the top it is exact.
            let mut index = 0;
            for (obj, list) in &mut candidates {
                let w1 = tile1.get_mesh_wrapper(*obj);
                let mut fresh = Vec::new();
                for info in list.iter_mut() {
                    let w2 = tile2.get_mesh_wrapper(info.other);
                    for vp in info.voxel_pairs.iter_mut() {
                        if w1.voxel_size(vp.v1, lod) > 0 && w2.voxel_size(vp.v2, lod) > 0 {
                            let measured = distances[index];
                            if lod == top_lod {
                                vp.dist = DistanceRange::exact(measured);
                            } else {
                                vp.dist.farthest = vp.dist.farthest.min(measured);
                            }
                            fresh.push(vp.dist);
                        }
                        index += 1;
                    }
                    info.refresh_distance();
                }
                for d in &fresh {
                    update_candidate_list(list, d);
                }
            }

            release_voxels(&candidates, tile1, tile2);
            eprintln!("[Join] lod {lod} finished in {:?}", round.elapsed());
            if distance_pair_count(&candidates) == 0 {
                break;
            }
        }

        // harvest what the last round resolved
        resolve_singletons(&mut candidates, &mut results);
        for (obj, list) in candidates.drain(..) {
            let best = list
                .into_iter()
                .min_by(|a, b| a.distance.closest.total_cmp(&b.distance.closest));
            if let Some(best) = best {
                results.push(NearestNeighbor {
                    object: obj,
                    neighbor: best.other,
                    distance: best.distance,
                });
            }
        }
        results.sort_by_key(|r| r.object);
        eprintln!(
            "[Join] nearest: {} results in {:?}",
            results.len(),
            start.elapsed()
        );
        Ok(results)
    }
}

/// MBB filtering for one reference object: the object-level distance
/// gates the candidate, then every voxel pair is screened against both
/// the pair list under construction and the wider candidate list.
fn seed_candidates(
    tile1: &Tile,
    tile2: &Tile,
    i: usize,
    same_tile: bool,
) -> Vec<DistanceCandidate> {
    let w1 = tile1.get_mesh_wrapper(i);
    let mut list = Vec::new();
    for j in 0..tile2.num_objects() {
        if same_tile && i == j {
            continue;
        }
        let w2 = tile2.get_mesh_wrapper(j);
        let d = w1.bounds.distance(&w2.bounds);
        if update_candidate_list(&mut list, &d) {
            let mut ci = DistanceCandidate {
                other: j,
                distance: d,
                voxel_pairs: Vec::new(),
            };
            for (vi, v1) in w1.voxels.iter().enumerate() {
                for (vj, v2) in w2.voxels.iter().enumerate() {
                    let vox_d = v1.bounds.distance(&v2.bounds);
                    if update_voxel_pair_list(&mut ci.voxel_pairs, &vox_d)
                        && update_candidate_list(&mut list, &vox_d)
                    {
                        ci.voxel_pairs.push(VoxelPair {
                            v1: vi,
                            v2: vj,
                            dist: vox_d,
                        });
                        ci.distance.update(&vox_d);
                    }
                }
            }
            if !ci.voxel_pairs.is_empty() {
                list.push(ci);
            }
        }
    }
    list
}

/// A lone candidate cannot be beaten: report it and drop the reference
/// object. Objects whose list emptied out are dropped without a result.
fn resolve_singletons(
    candidates: &mut Vec<CandidateEntry<DistanceCandidate>>,
    results: &mut Vec<NearestNeighbor>,
) {
    candidates.retain_mut(|(obj, list)| match list.len() {
        0 => false,
        1 => {
            let c = list.remove(0);
            results.push(NearestNeighbor {
                object: *obj,
                neighbor: c.other,
                distance: c.distance,
            });
            false
        }
        _ => true,
    });
}

fn release_voxels(
    candidates: &[CandidateEntry<DistanceCandidate>],
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
