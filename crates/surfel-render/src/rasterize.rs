use std::sync::atomic::{AtomicU32, Ordering};

use glam::{UVec2, Vec2, Vec3};
use rayon::prelude::*;
use surfel_kernel::{AtomicF32, DisjointSlice, accumulators};

use crate::camera::Camera;
use crate::distortion::{DistortionModel, DistortionMoments};
use crate::project::ProjectedSplat;
use crate::{
    ALPHA_THRESHOLD, FILTER_INV_SQUARE, MAX_ALPHA, MIN_TRANSMITTANCE, NEAR_PLANE, TILE_WIDTH,
};

/// One splat evaluated at one pixel.
#[derive(Clone, Copy, Debug)]
pub struct PixelEval {
    /// `px·m₂ − m₀`
    pub k: Vec3,
    /// `py·m₂ − m₁`
    pub l: Vec3,
    /// `k × l`, the homogeneous splat-local intersection.
    pub p: Vec3,
    /// Splat-local intersection of the pixel ray.
    pub s: Vec2,
    /// Projected center minus pixel.
    pub d: Vec2,
    /// Whether the ray/plane intersection won over the screen space filter.
    pub use_3d: bool,
    pub gauss: f32,
    /// View depth of the intersection, or of the center when the filter won.
    pub depth: f32,
    pub alpha: f32,
    /// Alpha hit [`MAX_ALPHA`], so it doesn't depend on opacity or falloff.
    pub saturated: bool,
}

/// Evaluate a splat at pixel center `pix`. `None` if it doesn't contribute there.
#[inline]
pub fn eval_splat(splat: &ProjectedSplat, pix: Vec2, sigma: f32) -> Option<PixelEval> {
    let kwh = &splat.kwh;
    let (m0, m1, m2) = (kwh.row(0), kwh.row(1), kwh.row(2));
    let k = pix.x * m2 - m0;
    let l = pix.y * m2 - m1;
    let p = k.cross(l);
    let s = Vec2::new(p.x / p.z, p.y / p.z);
    let rho3 = s.length_squared();

    let d = splat.xy() - pix;
    let rho2 = FILTER_INV_SQUARE * d.length_squared();

    // A ray parallel to the plane gives a NaN rho3, which falls back to the filter.
    let use_3d = rho3 <= rho2;
    let (rho, depth) = if use_3d {
        (rho3, m2.x * s.x + m2.y * s.y + m2.z)
    } else {
        (rho2, m2.z)
    };
    if depth.is_nan() || depth < NEAR_PLANE {
        return None;
    }

    let gauss = (-0.5 * sigma * rho).exp();
    let raw_alpha = splat.opacity() * gauss;
    let alpha = raw_alpha.min(MAX_ALPHA);
    if alpha < ALPHA_THRESHOLD {
        return None;
    }

    Some(PixelEval {
        k,
        l,
        p,
        s,
        d,
        use_3d,
        gauss,
        depth,
        alpha,
        saturated: raw_alpha > MAX_ALPHA,
    })
}

/// Pixel center of pixel `(x, y)`.
#[inline]
pub fn pixel_center(x: u32, y: u32) -> Vec2 {
    Vec2::new(x as f32 + 0.5, y as f32 + 0.5)
}

/// Pixels of tile `tile_id`, clipped to the image.
pub fn tile_pixels(
    tile_id: u32,
    tile_bounds: UVec2,
    img_size: UVec2,
) -> impl Iterator<Item = UVec2> {
    let tile = UVec2::new(tile_id % tile_bounds.x, tile_id / tile_bounds.x);
    let min = tile * TILE_WIDTH;
    let max = (min + TILE_WIDTH).min(img_size);
    (min.y..max.y).flat_map(move |y| (min.x..max.x).map(move |x| UVec2::new(x, y)))
}

/// Composited splats of one pixel, back to front.
///
/// Starts from the transmittance left after compositing and divides each splat's alpha back
/// out, so every step carries the transmittance in front of that splat, as forward saw it.
pub struct PixelReplay<'a> {
    projected: &'a [ProjectedSplat],
    entries: &'a [u32],
    pix: Vec2,
    sigma: f32,
    t: f32,
    next: usize,
}

#[derive(Clone, Copy, Debug)]
pub struct ReplayStep {
    /// Position within the tile's range.
    pub entry: usize,
    pub splat: u32,
    pub eval: PixelEval,
    /// Transmittance in front of the splat.
    pub t: f32,
}

impl<'a> PixelReplay<'a> {
    /// `entries` is the pixel's tile range, `last_contributor` and `final_t` what forward
    /// recorded for the pixel.
    pub fn new(
        projected: &'a [ProjectedSplat],
        entries: &'a [u32],
        last_contributor: u32,
        final_t: f32,
        pix: Vec2,
        sigma: f32,
    ) -> Self {
        let next = (last_contributor as usize).min(entries.len());
        Self {
            projected,
            entries,
            pix,
            sigma,
            t: final_t,
            next,
        }
    }
}

impl Iterator for PixelReplay<'_> {
    type Item = ReplayStep;

    fn next(&mut self) -> Option<ReplayStep> {
        while self.next > 0 {
            self.next -= 1;
            let splat = self.entries[self.next];
            if let Some(eval) = eval_splat(&self.projected[splat as usize], self.pix, self.sigma) {
                self.t /= 1.0 - eval.alpha;
                return Some(ReplayStep {
                    entry: self.next,
                    splat,
                    eval,
                    t: self.t,
                });
            }
        }
        None
    }
}

/// Planar per pixel outputs of a forward render, `[C][H][W]`.
pub struct PixelTargets<'a> {
    pub color: &'a mut [f32],
    pub depth: &'a mut [f32],
    pub normal: &'a mut [f32],
    pub opacity: &'a mut [f32],
    pub distortion: &'a mut [f32],
}

/// Per pixel state kept for the backward pass.
pub struct PixelState<'a> {
    pub final_t: &'a mut [f32],
    pub n_contrib: &'a mut [u32],
    pub last_contributor: &'a mut [u32],
    pub moments: &'a mut [DistortionMoments],
}

/// Running per splat statistics over every pixel a splat was composited into.
pub struct SplatAccumulators {
    pub weight_sum: Vec<AtomicF32>,
    pub max_weight: Vec<AtomicF32>,
    pub pixel_count: Vec<AtomicU32>,
}

impl SplatAccumulators {
    pub fn new(num_splats: usize) -> Self {
        Self {
            weight_sum: accumulators(num_splats),
            max_weight: accumulators(num_splats),
            pixel_count: (0..num_splats).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    fn merge(&self, splat: usize, stats: &EntryStats) {
        if stats.count == 0 {
            return;
        }
        self.weight_sum[splat].add(stats.weight_sum);
        self.max_weight[splat].max(stats.max_weight);
        self.pixel_count[splat].fetch_add(stats.count, Ordering::Relaxed);
    }
}

#[derive(Clone, Copy, Default)]
struct EntryStats {
    weight_sum: f32,
    max_weight: f32,
    count: u32,
}

struct PixelOut<'a> {
    color: DisjointSlice<'a, f32>,
    depth: DisjointSlice<'a, f32>,
    normal: DisjointSlice<'a, f32>,
    opacity: DisjointSlice<'a, f32>,
    distortion: DisjointSlice<'a, f32>,
    final_t: DisjointSlice<'a, f32>,
    n_contrib: DisjointSlice<'a, u32>,
    last_contributor: DisjointSlice<'a, u32>,
    moments: DisjointSlice<'a, DistortionMoments>,
}

/// Composite every tile front to back, one worker per tile.
#[allow(clippy::too_many_arguments)]
pub fn rasterize_forward(
    projected: &[ProjectedSplat],
    sorted_splats: &[u32],
    ranges: &[[u32; 2]],
    camera: &Camera,
    sigma: f32,
    distortion: &dyn DistortionModel,
    state: PixelState<'_>,
    targets: PixelTargets<'_>,
    stats: Option<&SplatAccumulators>,
) {
    let _span = tracing::trace_span!("Rasterize").entered();

    let img_size = camera.img_size;
    let tile_bounds = camera.tile_bounds();
    let num_pixels = camera.num_pixels();
    let background = camera.background;

    let out = PixelOut {
        color: DisjointSlice::new(targets.color),
        depth: DisjointSlice::new(targets.depth),
        normal: DisjointSlice::new(targets.normal),
        opacity: DisjointSlice::new(targets.opacity),
        distortion: DisjointSlice::new(targets.distortion),
        final_t: DisjointSlice::new(state.final_t),
        n_contrib: DisjointSlice::new(state.n_contrib),
        last_contributor: DisjointSlice::new(state.last_contributor),
        moments: DisjointSlice::new(state.moments),
    };

    ranges.par_iter().enumerate().for_each(|(tile_id, &[start, end])| {
        let entries = &sorted_splats[start as usize..end as usize];
        let num_stats = if stats.is_some() { entries.len() } else { 0 };
        let mut entry_stats = vec![EntryStats::default(); num_stats];

        for px in tile_pixels(tile_id as u32, tile_bounds, img_size) {
            let pix = pixel_center(px.x, px.y);
            let mut t = 1.0f32;
            let mut color = Vec3::ZERO;
            let mut depth = 0.0;
            let mut normal = Vec3::ZERO;
            let mut moments = DistortionMoments::default();
            let mut dist = 0.0;
            let mut n_contrib = 0;
            let mut last_contributor = 0;

            for (i, &gid) in entries.iter().enumerate() {
                let splat = &projected[gid as usize];
                let Some(eval) = eval_splat(splat, pix, sigma) else {
                    continue;
                };
                let next_t = t * (1.0 - eval.alpha);
                if next_t < MIN_TRANSMITTANCE {
                    break;
                }

                let weight = eval.alpha * t;
                color += weight * splat.color;
                depth += weight * eval.depth;
                normal += weight * splat.normal;
                dist += distortion.forward_step(weight, eval.depth, 1.0 - t, &mut moments);
                t = next_t;
                n_contrib += 1;
                last_contributor = i as u32 + 1;

                if let Some(s) = entry_stats.get_mut(i) {
                    s.weight_sum += weight;
                    s.max_weight = s.max_weight.max(weight);
                    s.count += 1;
                }
            }

            let color = color + t * background;
            let pix_id = (px.x + px.y * img_size.x) as usize;
            // SAFETY: Tiles don't overlap, so every pixel index is written by exactly one worker,
            // and planes are `num_pixels` apart.
            unsafe {
                for c in 0..3 {
                    out.color.write(c * num_pixels + pix_id, color[c]);
                    out.normal.write(c * num_pixels + pix_id, normal[c]);
                }
                out.depth.write(pix_id, depth);
                out.opacity.write(pix_id, 1.0 - t);
                out.distortion.write(pix_id, dist);
                out.final_t.write(pix_id, t);
                out.n_contrib.write(pix_id, n_contrib);
                out.last_contributor.write(pix_id, last_contributor);
                out.moments.write(pix_id, moments);
            }
        }

        if let Some(stats) = stats {
            for (&gid, s) in entries.iter().zip(&entry_stats) {
                stats.merge(gid as usize, s);
            }
        }
    });
}
