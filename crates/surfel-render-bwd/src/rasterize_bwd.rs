use glam::{Mat3, Vec2, Vec3};
use rayon::prelude::*;
use surfel_kernel::{AtomicF32, accumulators};
use surfel_render::camera::Camera;
use surfel_render::distortion::DistortionModel;
use surfel_render::rasterize::{PixelReplay, pixel_center, tile_pixels};
use surfel_render::{FILTER_INV_SQUARE, RenderSession};

use crate::render_bwd::PixelGrads;

/// Gradients of one splat's screen space quantities, summed over pixels.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ScreenGrads {
    /// Gradient of the homography, `v_kwh.row(r)` for row `m_r`.
    pub v_kwh: Mat3,
    /// Gradient of the projected center through the screen space filter only.
    pub v_xy: Vec2,
    /// Sum of per pixel absolute screen space translation gradients.
    pub v_xy_abs: Vec2,
    pub v_opacity: f32,
    pub v_color: Vec3,
    /// Gradient of the camera space normal.
    pub v_normal: Vec3,
}

const GRAD_LEN: usize = size_of::<ScreenGrads>() / size_of::<f32>();

impl ScreenGrads {
    pub const ZERO: Self = Self {
        v_kwh: Mat3::ZERO,
        v_xy: Vec2::ZERO,
        v_xy_abs: Vec2::ZERO,
        v_opacity: 0.0,
        v_color: Vec3::ZERO,
        v_normal: Vec3::ZERO,
    };

    /// Gradient of translating the splat in the screen plane at constant depth, given the view
    /// depth of its center.
    pub fn v_mean2d(&self, depth: f32) -> Vec2 {
        self.v_xy + depth * Vec2::new(self.v_kwh.z_axis.x, self.v_kwh.z_axis.y)
    }
}

impl std::ops::AddAssign for ScreenGrads {
    fn add_assign(&mut self, rhs: Self) {
        self.v_kwh += rhs.v_kwh;
        self.v_xy += rhs.v_xy;
        self.v_xy_abs += rhs.v_xy_abs;
        self.v_opacity += rhs.v_opacity;
        self.v_color += rhs.v_color;
        self.v_normal += rhs.v_normal;
    }
}

fn merge(acc: &[AtomicF32], splat: usize, grads: &ScreenGrads) {
    let values: [f32; GRAD_LEN] = bytemuck::cast(*grads);
    for (a, v) in acc[splat * GRAD_LEN..(splat + 1) * GRAD_LEN].iter().zip(values) {
        a.add(v);
    }
}

/// Upstream gradients of one pixel.
struct PixelUpstream {
    color: Vec3,
    depth: f32,
    normal: Vec3,
    opacity: f32,
    distortion: f32,
}

impl PixelUpstream {
    fn read(grads: &PixelGrads<'_>, pix_id: usize, num_pixels: usize) -> Self {
        let plane3 = |buf: &[f32]| {
            Vec3::new(
                buf[pix_id],
                buf[num_pixels + pix_id],
                buf[2 * num_pixels + pix_id],
            )
        };
        Self {
            color: plane3(grads.v_color),
            depth: grads.v_depth[pix_id],
            normal: plane3(grads.v_normal),
            opacity: grads.v_opacity[pix_id],
            distortion: grads.v_distortion[pix_id],
        }
    }
}

/// Replay one pixel back to front, adding every composited splat's gradients into
/// `entry_grads`, indexed by position in the tile range.
#[allow(clippy::too_many_arguments)]
fn pixel_backward(
    session: &RenderSession<'_>,
    entries: &[u32],
    pix_id: usize,
    pix: Vec2,
    upstream: &PixelUpstream,
    background: Vec3,
    distortion: &dyn DistortionModel,
    entry_grads: &mut [ScreenGrads],
) {
    let projected = session.geometry.projected;
    let image = &session.image;
    let sigma = session.config.sigma;
    let final_t = image.final_t[pix_id];
    let final_weight = 1.0 - final_t;
    let final_moments = image.moments[pix_id];
    let bg_dot = background.dot(upstream.color);

    // Compositing of everything behind the current splat, as seen right behind it.
    let mut accum_color = Vec3::ZERO;
    let mut accum_depth = 0.0;
    let mut accum_normal = Vec3::ZERO;
    let mut accum_alpha = 0.0;
    let mut last_alpha = 0.0;
    let mut last_color = Vec3::ZERO;
    let mut last_depth = 0.0;
    let mut last_normal = Vec3::ZERO;
    // Distortion gradient carried through the transmittance of later splats.
    let mut last_v_dist_t = 0.0;

    let replay = PixelReplay::new(
        projected,
        entries,
        image.last_contributor[pix_id],
        final_t,
        pix,
        sigma,
    );

    for step in replay {
        let splat = &projected[step.splat as usize];
        let eval = step.eval;
        let (t, alpha) = (step.t, eval.alpha);
        let weight = alpha * t;

        accum_color = last_alpha * last_color + (1.0 - last_alpha) * accum_color;
        accum_depth = last_alpha * last_depth + (1.0 - last_alpha) * accum_depth;
        accum_normal = last_alpha * last_normal + (1.0 - last_alpha) * accum_normal;
        accum_alpha = last_alpha + (1.0 - last_alpha) * accum_alpha;
        last_alpha = alpha;
        last_color = splat.color;
        last_depth = eval.depth;
        last_normal = splat.normal;

        let dist = distortion.backward_step(
            weight,
            eval.depth,
            final_weight,
            final_moments,
            upstream.distortion,
        );

        let mut v_alpha = (splat.color - accum_color).dot(upstream.color)
            + (eval.depth - accum_depth) * upstream.depth
            + (splat.normal - accum_normal).dot(upstream.normal)
            + (1.0 - accum_alpha) * upstream.opacity
            + (dist.weight - last_v_dist_t);
        last_v_dist_t = dist.weight * alpha + (1.0 - alpha) * last_v_dist_t;
        v_alpha *= t;
        v_alpha -= final_t / (1.0 - alpha) * bg_dot;

        let v_depth = weight * upstream.depth + dist.depth;

        let grads = &mut entry_grads[step.entry];
        grads.v_color += weight * upstream.color;
        grads.v_normal += weight * upstream.normal;

        // Saturated alpha is constant in opacity and falloff.
        let v_gauss = if eval.saturated {
            0.0
        } else {
            grads.v_opacity += eval.gauss * v_alpha;
            splat.opacity() * v_alpha
        };

        let m2 = splat.kwh.row(2);
        let mut v_filter = Vec2::ZERO;
        let (v_m0, v_m1, v_m2) = if eval.use_3d {
            let s = eval.s;
            let v_s = v_gauss * (-sigma * eval.gauss) * s + v_depth * Vec2::new(m2.x, m2.y);
            let pz = eval.p.z;
            let v_p = Vec3::new(v_s.x / pz, v_s.y / pz, -(v_s.x * s.x + v_s.y * s.y) / pz);
            let v_k = eval.l.cross(v_p);
            let v_l = v_p.cross(eval.k);
            (
                -v_k,
                -v_l,
                pix.x * v_k + pix.y * v_l + v_depth * Vec3::new(s.x, s.y, 1.0),
            )
        } else {
            v_filter = v_gauss * (-sigma * FILTER_INV_SQUARE * eval.gauss) * eval.d;
            (Vec3::ZERO, Vec3::ZERO, Vec3::new(0.0, 0.0, v_depth))
        };

        grads.v_kwh += Mat3::from_cols(v_m0, v_m1, v_m2).transpose();
        grads.v_xy += v_filter;
        let center_depth = splat.kwh.z_axis.z;
        let v_translate = v_filter + center_depth * Vec2::new(v_m0.z, v_m1.z);
        grads.v_xy_abs += v_translate.abs();
    }
}

/// Gradients of every splat's screen space quantities. One worker per tile; a worker gathers
/// gradients for its own intersections and merges each one into the shared per splat sums once.
pub fn rasterize_backward(
    session: &RenderSession<'_>,
    camera: &Camera,
    grads: &PixelGrads<'_>,
) -> Vec<ScreenGrads> {
    let _span = tracing::trace_span!("RasterizeBackward").entered();

    let num_splats = session.num_splats;
    let img_size = session.img_size;
    let tile_bounds = session.tile_bounds();
    let num_pixels = img_size.x as usize * img_size.y as usize;
    let background = camera.background;
    let distortion = session.config.distortion_model();
    let acc = accumulators(num_splats * GRAD_LEN);

    session
        .image
        .ranges
        .par_iter()
        .enumerate()
        .for_each(|(tile_id, &[start, end])| {
            let entries = &session.binning.values[start as usize..end as usize];
            if entries.is_empty() {
                return;
            }
            let mut entry_grads = vec![ScreenGrads::ZERO; entries.len()];

            for px in tile_pixels(tile_id as u32, tile_bounds, img_size) {
                let pix_id = (px.x + px.y * img_size.x) as usize;
                let upstream = PixelUpstream::read(grads, pix_id, num_pixels);
                pixel_backward(
                    session,
                    entries,
                    pix_id,
                    pixel_center(px.x, px.y),
                    &upstream,
                    background,
                    distortion.as_ref(),
                    &mut entry_grads,
                );
            }

            for (&gid, g) in entries.iter().zip(&entry_grads) {
                if *g != ScreenGrads::ZERO {
                    merge(&acc, gid as usize, g);
                }
            }
        });

    acc.chunks_exact(GRAD_LEN)
        .map(|chunk| {
            let values: [f32; GRAD_LEN] = std::array::from_fn(|i| chunk[i].load());
            bytemuck::cast(values)
        })
        .collect()
}
