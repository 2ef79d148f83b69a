use glam::{Mat3, Vec3};
use surfel_render::camera::Camera;
use surfel_render::config::RenderConfig;
use surfel_render::project::{ProjectedSplat, SplatFrame, normalize_quat, quat_to_mat};
use surfel_render::sh::{ClampMask, sh_basis, sh_basis_grad, sh_coeffs_for_degree};
use surfel_render::splats::{SplatColors, SplatInputs};

use crate::rasterize_bwd::ScreenGrads;

/// Gradient of a `[w, x, y, z]` quaternion from the gradient of its rotation matrix, where
/// `v_r.col(j)[i]` is the gradient of `R[i][j]`. The quaternion must be normalized.
pub fn quat_to_mat_vjp(q: [f32; 4], v_r: Mat3) -> [f32; 4] {
    let [w, x, y, z] = q;
    let g = |i: usize, j: usize| v_r.col(j)[i];
    let (g00, g01, g02) = (g(0, 0), g(0, 1), g(0, 2));
    let (g10, g11, g12) = (g(1, 0), g(1, 1), g(1, 2));
    let (g20, g21, g22) = (g(2, 0), g(2, 1), g(2, 2));

    [
        2.0 * (-z * g01 + y * g02 + z * g10 - x * g12 - y * g20 + x * g21),
        2.0 * (y * g01 + z * g02 + y * g10 - 2.0 * x * g11 - w * g12 + z * g20 + w * g21
            - 2.0 * x * g22),
        2.0 * (-2.0 * y * g00 + x * g01 + w * g02 + x * g10 + z * g12 - w * g20 + z * g21
            - 2.0 * y * g22),
        2.0 * (-2.0 * z * g00 - w * g01 + x * g02 + w * g10 - 2.0 * z * g11 + y * g12 + x * g20
            + y * g21),
    ]
}

/// Gradient of a raw quaternion given the gradient of its normalized version.
pub fn normalize_quat_vjp(q: [f32; 4], v_normalized: [f32; 4]) -> [f32; 4] {
    let Some((q_hat, norm)) = normalize_quat(q) else {
        return [0.0; 4];
    };
    let dot: f32 = q_hat.iter().zip(&v_normalized).map(|(a, b)| a * b).sum();
    std::array::from_fn(|i| (v_normalized[i] - q_hat[i] * dot) / norm)
}

/// Gradient of a point from the gradient of its direction `dir = normalize(point - origin)`.
fn normalize_vjp(offset: Vec3, v_dir: Vec3) -> Vec3 {
    let len = offset.length();
    if len <= 0.0 || !len.is_finite() {
        return Vec3::ZERO;
    }
    let dir = offset / len;
    (v_dir - dir * dir.dot(v_dir)) / len
}

fn unclamped(v_color: Vec3, clamped: ClampMask) -> Vec3 {
    Vec3::from_array(std::array::from_fn(|c| {
        if (clamped & (1 << c)) == 0 { v_color[c] } else { 0.0 }
    }))
}

/// Parameter gradients of one splat.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub(crate) struct ParamGrads {
    pub v_mean: Vec3,
    pub v_scale: Vec3,
    pub v_quat: [f32; 4],
}

/// Chain one splat's screen space gradients back to its parameters. Writes the color gradient
/// into `v_colors`, one entry per coefficient (or a single entry for precomputed colors).
pub(crate) fn project_backward(
    inputs: &SplatInputs<'_>,
    idx: usize,
    camera: &Camera,
    config: &RenderConfig,
    projected: &ProjectedSplat,
    grads: &ScreenGrads,
    v_colors: &mut [Vec3],
) -> ParamGrads {
    v_colors.fill(Vec3::ZERO);
    if !projected.is_visible() {
        return ParamGrads::default();
    }
    let raw_quat = inputs.rotations[idx];
    let Some((quat, _)) = normalize_quat(raw_quat) else {
        return ParamGrads::default();
    };

    let mean = inputs.means[idx];
    let p_view = camera.world_to_view(mean);
    let scale = inputs.scales[idx] * config.scale_modifier;
    let rot = quat_to_mat(quat);
    let frame = SplatFrame::new(camera, rot, scale, p_view);
    let w_t = camera.rotation().transpose();

    let v_h = camera.intrinsics().transpose() * grads.v_kwh;
    let v_h0 = w_t * v_h.x_axis;
    let v_h1 = w_t * v_h.y_axis;

    let v_rot = Mat3::from_cols(
        scale.x * v_h0,
        scale.y * v_h1,
        frame.normal_sign * (w_t * grads.v_normal),
    );
    let v_scale =
        config.scale_modifier * Vec3::new(rot.x_axis.dot(v_h0), rot.y_axis.dot(v_h1), 0.0);
    let v_quat = normalize_quat_vjp(raw_quat, quat_to_mat_vjp(quat, v_rot));

    // Through the filter, the projected center moves with the view space center.
    let g = grads.v_xy;
    let focal = camera.focal;
    let Vec3 { x, y, z } = p_view;
    let v_center = Vec3::new(
        focal.x * g.x / z,
        focal.y * g.y / z,
        -(focal.x * x * g.x + focal.y * y * g.y) / (z * z),
    );
    let mut v_mean = w_t * (v_h.z_axis + v_center);

    match inputs.colors {
        SplatColors::Sh {
            degree,
            coeffs_per_splat,
            coeffs,
        } => {
            let stride = coeffs_per_splat as usize;
            let coeffs = &coeffs[idx * stride..(idx + 1) * stride];
            let offset = mean - camera.position;
            let dir = offset.normalize_or_zero();
            let v_color = unclamped(grads.v_color, projected.clamped);
            let num = sh_coeffs_for_degree(degree) as usize;

            let basis = sh_basis(degree, dir);
            for (v, b) in v_colors[..num].iter_mut().zip(basis) {
                *v = b * v_color;
            }
            let basis_grad = sh_basis_grad(degree, dir);
            let v_dir: Vec3 = coeffs[..num]
                .iter()
                .zip(basis_grad)
                .map(|(c, db)| c.dot(v_color) * db)
                .sum();
            v_mean += normalize_vjp(offset, v_dir);
        }
        SplatColors::Precomputed(_) => v_colors[0] = grads.v_color,
    }

    ParamGrads {
        v_mean,
        v_scale,
        v_quat,
    }
}
