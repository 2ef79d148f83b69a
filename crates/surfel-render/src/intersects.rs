use glam::UVec2;
use rayon::prelude::*;
use surfel_kernel::DisjointSlice;
use surfel_sort::{bits_needed, radix_argsort};

use crate::project::ProjectedSplat;

/// Maps a depth to a `u32` with the same total order, negative depths included.
#[inline]
pub fn sortable_depth(depth: f32) -> u32 {
    let bits = depth.to_bits();
    if bits >> 31 == 1 {
        !bits
    } else {
        bits | 0x8000_0000
    }
}

/// Sort key of one splat/tile intersection: tile id in the high word, depth in the low word.
#[inline]
pub fn intersect_key(tile_id: u32, depth: f32) -> u64 {
    (u64::from(tile_id) << 32) | u64::from(sortable_depth(depth))
}

#[inline]
pub fn key_tile(key: u64) -> u32 {
    (key >> 32) as u32
}

/// Write one key/value pair per touched tile of every splat.
///
/// `cum_tiles_hit` is the inclusive prefix sum of the tile counts, so splat `i` owns the output
/// range `cum_tiles_hit[i] - tiles_touched .. cum_tiles_hit[i]`.
pub fn map_splats_to_intersects(
    projected: &[ProjectedSplat],
    cum_tiles_hit: &[u32],
    tile_bounds: UVec2,
    keys: &mut [u64],
    values: &mut [u32],
) {
    assert_eq!(
        projected.len(),
        cum_tiles_hit.len(),
        "One prefix sum entry per splat"
    );
    let _span = tracing::trace_span!("MapSplatsToIntersects").entered();

    let keys = DisjointSlice::new(keys);
    let values = DisjointSlice::new(values);
    projected
        .par_iter()
        .zip(cum_tiles_hit.par_iter())
        .enumerate()
        .filter(|(_, (splat, _))| splat.tiles_touched > 0)
        .for_each(|(idx, (splat, &end))| {
            let mut offset = (end - splat.tiles_touched) as usize;
            for ty in splat.rect_min.y..splat.rect_max.y {
                for tx in splat.rect_min.x..splat.rect_max.x {
                    let tile_id = tx + ty * tile_bounds.x;
                    // SAFETY: The prefix sum gives every splat its own range of `tiles_touched`
                    // slots, and the rect has exactly that many tiles.
                    unsafe {
                        keys.write(offset, intersect_key(tile_id, splat.depth()));
                        values.write(offset, idx as u32);
                    }
                    offset += 1;
                }
            }
        });
}

/// Sort intersections by tile, then front to back. Only the bits a tile id can occupy are sorted.
pub fn sort_intersects(
    keys: &mut [u64],
    values: &mut [u32],
    scratch_keys: &mut [u64],
    scratch_values: &mut [u32],
    num_tiles: u32,
) {
    let _span = tracing::trace_span!("SortIntersects", num = keys.len()).entered();
    let bits = 32 + bits_needed(u64::from(num_tiles.saturating_sub(1)));
    radix_argsort(keys, values, scratch_keys, scratch_values, bits);
}

/// `[start, end)` of every tile's run in the sorted keys. Tiles nothing touches get an empty
/// range.
pub fn get_tile_offsets(sorted_keys: &[u64], ranges: &mut [[u32; 2]]) {
    let _span = tracing::trace_span!("GetTileOffsets").entered();
    ranges.par_iter_mut().enumerate().for_each(|(tile, range)| {
        let tile = tile as u32;
        let start = sorted_keys.partition_point(|&k| key_tile(k) < tile);
        let end = start + sorted_keys[start..].partition_point(|&k| key_tile(k) == tile);
        *range = [start as u32, end as u32];
    });
}
