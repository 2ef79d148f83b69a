use glam::{Mat3, UVec2, Vec2, Vec3};
use rayon::prelude::*;

use crate::camera::Camera;
use crate::config::RenderConfig;
use crate::sh::{ClampMask, sh_to_color};
use crate::splats::{SplatColors, SplatInputs};
use crate::visibility::{in_front, in_frustum};
use crate::{ALPHA_THRESHOLD, FILTER_INV_SQUARE, TILE_WIDTH};

/// Per splat output of the projector, consumed by binning and both rasterizers.
///
/// A splat with `radius == 0` was culled and touches no tiles.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ProjectedSplat {
    /// Screen space center (x, y), view depth and opacity, packed for the rasterizer.
    pub center_opacity: [f32; 4],
    /// Screen space radius in pixels.
    pub radius: u32,
    /// `K·[W·R₀·sₓ, W·R₁·s_y, W·c + t]`, maps splat-local `(u, v, 1)` to homogeneous pixels.
    pub kwh: Mat3,
    /// Camera space normal, facing the camera.
    pub normal: Vec3,
    pub color: Vec3,
    pub clamped: ClampMask,
    /// Touched tiles, `[rect_min, rect_max)`.
    pub rect_min: UVec2,
    pub rect_max: UVec2,
    pub tiles_touched: u32,
}

impl ProjectedSplat {
    #[inline]
    pub fn xy(&self) -> Vec2 {
        Vec2::new(self.center_opacity[0], self.center_opacity[1])
    }

    #[inline]
    pub fn depth(&self) -> f32 {
        self.center_opacity[2]
    }

    #[inline]
    pub fn opacity(&self) -> f32 {
        self.center_opacity[3]
    }

    #[inline]
    pub fn is_visible(&self) -> bool {
        self.radius > 0
    }
}

/// Rotation matrix of a normalized `[w, x, y, z]` quaternion. Columns are the local axes.
pub fn quat_to_mat(q: [f32; 4]) -> Mat3 {
    let [w, x, y, z] = q;
    Mat3::from_cols(
        Vec3::new(
            1.0 - 2.0 * (y * y + z * z),
            2.0 * (x * y + w * z),
            2.0 * (x * z - w * y),
        ),
        Vec3::new(
            2.0 * (x * y - w * z),
            1.0 - 2.0 * (x * x + z * z),
            2.0 * (y * z + w * x),
        ),
        Vec3::new(
            2.0 * (x * z + w * y),
            2.0 * (y * z - w * x),
            1.0 - 2.0 * (x * x + y * y),
        ),
    )
}

/// Normalized quaternion and the norm it was divided by, `None` for a degenerate quaternion.
pub fn normalize_quat(q: [f32; 4]) -> Option<([f32; 4], f32)> {
    let norm = q.iter().map(|v| v * v).sum::<f32>().sqrt();
    (norm > 1e-12 && norm.is_finite()).then(|| (q.map(|v| v / norm), norm))
}

/// Splat-local cutoff radius: the Gaussian is negligible past `3/√σ`.
pub fn cutoff_radius(sigma: f32) -> f32 {
    3.0 / sigma.sqrt()
}

/// Homography pieces of one splat, shared between projection and its backward pass.
#[derive(Clone, Copy, Debug)]
pub struct SplatFrame {
    /// Rotation from the normalized quaternion.
    pub rot: Mat3,
    /// Scale after the scale modifier.
    pub scale: Vec3,
    /// Center in view space.
    pub p_view: Vec3,
    /// `[W·R₀·sₓ, W·R₁·s_y, W·c + t]`
    pub h: Mat3,
    pub kwh: Mat3,
    /// +1 if the local z axis already faces the camera, -1 if the normal was flipped.
    pub normal_sign: f32,
}

impl SplatFrame {
    pub fn new(camera: &Camera, rot: Mat3, scale: Vec3, p_view: Vec3) -> Self {
        let w = camera.rotation();
        let h = Mat3::from_cols(
            w * rot.x_axis * scale.x,
            w * rot.y_axis * scale.y,
            p_view,
        );
        let kwh = camera.intrinsics() * h;
        let normal = w * rot.z_axis;
        let normal_sign = if normal.dot(p_view) > 0.0 { -1.0 } else { 1.0 };
        Self {
            rot,
            scale,
            p_view,
            h,
            kwh,
            normal_sign,
        }
    }

    pub fn normal(&self, camera: &Camera) -> Vec3 {
        self.normal_sign * (camera.rotation() * self.rot.z_axis)
    }
}

/// Screen space bounding box of the splat's cutoff disk, from the dual conic of the circle of
/// radius `cutoff` mapped through `kwh`. Returns `(center, half_extent)`, or `None` when the disk
/// doesn't project to a bounded ellipse.
pub fn conic_bounds(kwh: &Mat3, cutoff: f32) -> Option<(Vec2, Vec2)> {
    let r2 = cutoff * cutoff;
    let [m0, m1, m2] = [kwh.row(0), kwh.row(1), kwh.row(2)];
    let q = |a: Vec3, b: Vec3| r2 * (a.x * b.x + a.y * b.y) - a.z * b.z;
    let q22 = q(m2, m2);
    if q22.is_nan() || q22 >= 0.0 {
        return None;
    }
    let (q00, q11) = (q(m0, m0), q(m1, m1));
    let (q02, q12) = (q(m0, m2), q(m1, m2));
    let center = Vec2::new(q02 / q22, q12 / q22);
    let disc = Vec2::new(q02 * q02 - q00 * q22, q12 * q12 - q11 * q22);
    if disc.x < 0.0 || disc.y < 0.0 {
        return None;
    }
    let half = Vec2::new(disc.x.sqrt(), disc.y.sqrt()) / q22.abs();
    (center.is_finite() && half.is_finite()).then_some((center, half))
}

/// Tile rect `[min, max)` covering the pixel box `[lo, hi]`, clamped to the tile grid.
pub fn tile_rect(lo: Vec2, hi: Vec2, tile_bounds: UVec2) -> (UVec2, UVec2) {
    let tile = TILE_WIDTH as f32;
    let bounds = tile_bounds.as_vec2();
    let min = (lo / tile).floor().clamp(Vec2::ZERO, bounds);
    let max = (hi / tile).ceil().clamp(Vec2::ZERO, bounds);
    (min.as_uvec2(), max.as_uvec2())
}

fn splat_color(inputs: &SplatInputs<'_>, idx: usize, mean: Vec3, camera: &Camera) -> (Vec3, u32) {
    match inputs.colors {
        SplatColors::Sh {
            degree,
            coeffs_per_splat,
            coeffs,
        } => {
            let stride = coeffs_per_splat as usize;
            let dir = (mean - camera.position).normalize_or_zero();
            sh_to_color(degree, &coeffs[idx * stride..(idx + 1) * stride], dir)
        }
        SplatColors::Precomputed(colors) => (colors[idx], 0),
    }
}

/// Project one splat. Culled splats come back as [`ProjectedSplat::default`].
pub fn project_splat(
    inputs: &SplatInputs<'_>,
    idx: usize,
    camera: &Camera,
    config: &RenderConfig,
) -> ProjectedSplat {
    let mean = inputs.means[idx];
    // Prefiltered splats already passed the frustum test, but still need a depth past the
    // near plane to project.
    let p_view = if config.prefiltered {
        in_front(mean, camera)
    } else {
        in_frustum(mean, camera)
    };
    let Some(p_view) = p_view else {
        return ProjectedSplat::default();
    };

    let opacity = inputs.opacities[idx];
    if opacity.is_nan() || opacity < ALPHA_THRESHOLD {
        return ProjectedSplat::default();
    }

    let Some((quat, _)) = normalize_quat(inputs.rotations[idx]) else {
        return ProjectedSplat::default();
    };
    let scale = inputs.scales[idx] * config.scale_modifier;
    let frame = SplatFrame::new(camera, quat_to_mat(quat), scale, p_view);

    let Some((aabb_center, aabb_half)) = conic_bounds(&frame.kwh, cutoff_radius(config.sigma))
    else {
        return ProjectedSplat::default();
    };

    // Around the center the low pass filter keeps the splat at least this wide.
    let xy = camera.view_to_pixel(p_view);
    let filter_radius = (9.0 / (FILTER_INV_SQUARE * config.sigma)).sqrt();
    let lo = (aabb_center - aabb_half).min(xy - filter_radius);
    let hi = (aabb_center + aabb_half).max(xy + filter_radius);
    if !lo.is_finite() || !hi.is_finite() {
        return ProjectedSplat::default();
    }

    let (rect_min, rect_max) = tile_rect(lo, hi, camera.tile_bounds());
    let extent = rect_max - rect_min;
    let tiles_touched = extent.x * extent.y;
    if tiles_touched == 0 {
        return ProjectedSplat::default();
    }

    let (color, clamped) = splat_color(inputs, idx, mean, camera);
    let radius = aabb_half.max_element().max(filter_radius).ceil();

    ProjectedSplat {
        center_opacity: [xy.x, xy.y, p_view.z, opacity],
        radius: (radius as u32).max(1),
        kwh: frame.kwh,
        normal: frame.normal(camera),
        color,
        clamped,
        rect_min,
        rect_max,
        tiles_touched,
    }
}

/// Project every splat in parallel, one task per splat.
pub fn project_splats(
    inputs: &SplatInputs<'_>,
    camera: &Camera,
    config: &RenderConfig,
    projected: &mut [ProjectedSplat],
) {
    projected
        .par_iter_mut()
        .enumerate()
        .for_each(|(idx, out)| *out = project_splat(inputs, idx, camera, config));
}
