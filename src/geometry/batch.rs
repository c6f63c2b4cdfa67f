//! Batched kernels over flat primitive buffers
//!
//! Each batch is described by `offset_size`: four values per pair
//! `(off1, n1, off2, n2)` indexing into a shared primitive buffer. Pairs
//! are independent; work is split across workers in contiguous chunks so
//! result `i` always corresponds to packed pair `i`.

use rayon::prelude::*;

use super::distance::{segments_distance, triangles_intersect_any};

/// Minimum segment distance for every pair in the batch.
///
/// `data` holds 6-float segments; pair `i` compares the `offset_size[4i+1]`
/// segments at offset `offset_size[4i]` against the `offset_size[4i+3]`
/// segments at offset `offset_size[4i+2]`.
pub fn segments_distance_batch(
    data: &[f32],
    offset_size: &[u32],
    distances: &mut [f32],
    threads: usize,
) {
    let pair_num = distances.len();
    debug_assert_eq!(offset_size.len(), 4 * pair_num);
    if pair_num == 0 {
        return;
    }
    let chunk = pair_num.div_ceil(threads.max(1));
    distances
        .par_chunks_mut(chunk)
        .zip(offset_size.par_chunks(4 * chunk))
        .for_each(|(out, pairs)| {
            for (i, d) in out.iter_mut().enumerate() {
                let off1 = pairs[4 * i] as usize;
                let n1 = pairs[4 * i + 1] as usize;
                let off2 = pairs[4 * i + 2] as usize;
                let n2 = pairs[4 * i + 3] as usize;
                *d = segments_distance(
                    &data[off1 * 6..(off1 + n1) * 6],
                    &data[off2 * 6..(off2 + n2) * 6],
                );
            }
        });
}

/// Triangle intersection flag for every pair in the batch.
///
/// Same shape as [`segments_distance_batch`] with 9-float triangles; a
/// pair's result is the short-circuit OR over its triangle pairs.
pub fn triangles_intersect_batch(
    data: &[f32],
    offset_size: &[u32],
    results: &mut [bool],
    threads: usize,
) {
    let pair_num = results.len();
    debug_assert_eq!(offset_size.len(), 4 * pair_num);
    if pair_num == 0 {
        return;
    }
    let chunk = pair_num.div_ceil(threads.max(1));
    results
        .par_chunks_mut(chunk)
        .zip(offset_size.par_chunks(4 * chunk))
        .for_each(|(out, pairs)| {
            for (i, r) in out.iter_mut().enumerate() {
                let off1 = pairs[4 * i] as usize;
                let n1 = pairs[4 * i + 1] as usize;
                let off2 = pairs[4 * i + 2] as usize;
                let n2 = pairs[4 * i + 3] as usize;
                *r = triangles_intersect_any(
                    &data[off1 * 9..(off1 + n1) * 9],
                    &data[off2 * 9..(off2 + n2) * 9],
                );
            }
        });
}
