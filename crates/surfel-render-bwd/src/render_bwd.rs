use glam::{Mat3, Vec2, Vec3};
use rayon::prelude::*;
use surfel_render::camera::Camera;
use surfel_render::splats::{SplatColors, SplatInputs};
use surfel_render::{RenderError, RenderSession, check_len};

use crate::project_bwd::project_backward;
use crate::rasterize_bwd::rasterize_backward;

/// Gradient of the loss with respect to every output image of the forward render, with the same
/// planar `[C][H][W]` layout.
#[derive(Clone, Copy, Debug)]
pub struct PixelGrads<'a> {
    pub v_color: &'a [f32],
    pub v_depth: &'a [f32],
    pub v_normal: &'a [f32],
    pub v_opacity: &'a [f32],
    pub v_distortion: &'a [f32],
}

impl PixelGrads<'_> {
    fn check(&self, num_pixels: usize) -> Result<(), RenderError> {
        check_len("dl_dcolor", self.v_color, 3 * num_pixels)?;
        check_len("dl_ddepth", self.v_depth, num_pixels)?;
        check_len("dl_dnormal", self.v_normal, 3 * num_pixels)?;
        check_len("dl_dopacity", self.v_opacity, num_pixels)?;
        check_len("dl_ddistortion", self.v_distortion, num_pixels)
    }
}

/// Caller owned gradient buffers, one entry per splat. Every entry is overwritten, culled splats
/// get zeros.
pub struct SplatGradTargets<'a> {
    pub v_means: &'a mut [Vec3],
    pub v_scales: &'a mut [Vec3],
    /// Gradient of the raw, unnormalized `[w, x, y, z]` rotations.
    pub v_quats: &'a mut [[f32; 4]],
    pub v_opacities: &'a mut [f32],
    /// `coeffs_per_splat` entries per splat for SH colors, one for precomputed colors.
    pub v_colors: &'a mut [Vec3],
    /// Gradient of the projected center for a move in the screen plane at constant depth.
    pub v_means2d: &'a mut [Vec2],
    /// Gradient of the splat homography.
    pub v_kwh: &'a mut [Mat3],
    /// Per pixel absolute values of the screen space translation gradient, summed. Useful as a
    /// densification signal.
    pub v_means2d_abs: &'a mut [Vec2],
}

fn colors_per_splat(colors: &SplatColors<'_>) -> usize {
    match colors {
        SplatColors::Sh {
            coeffs_per_splat, ..
        } => *coeffs_per_splat as usize,
        SplatColors::Precomputed(_) => 1,
    }
}

impl SplatGradTargets<'_> {
    fn check(&self, splats: &SplatInputs<'_>) -> Result<(), RenderError> {
        let n = splats.len();
        check_len("dl_dmeans", self.v_means, n)?;
        check_len("dl_dscales", self.v_scales, n)?;
        check_len("dl_drotations", self.v_quats, n)?;
        check_len("dl_dopacity", self.v_opacities, n)?;
        check_len("dl_dcolors", self.v_colors, n * colors_per_splat(&splats.colors))?;
        check_len("dl_dmean2d", self.v_means2d, n)?;
        check_len("dl_dkwh", self.v_kwh, n)?;
        check_len("dl_dmean2d_abs", self.v_means2d_abs, n)
    }
}

/// Owned splat gradients, sized for a set of inputs.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SplatGrads {
    pub v_means: Vec<Vec3>,
    pub v_scales: Vec<Vec3>,
    pub v_quats: Vec<[f32; 4]>,
    pub v_opacities: Vec<f32>,
    pub v_colors: Vec<Vec3>,
    pub v_means2d: Vec<Vec2>,
    pub v_kwh: Vec<Mat3>,
    pub v_means2d_abs: Vec<Vec2>,
}

impl SplatGrads {
    pub fn new(splats: &SplatInputs<'_>) -> Self {
        let n = splats.len();
        Self {
            v_means: vec![Vec3::ZERO; n],
            v_scales: vec![Vec3::ZERO; n],
            v_quats: vec![[0.0; 4]; n],
            v_opacities: vec![0.0; n],
            v_colors: vec![Vec3::ZERO; n * colors_per_splat(&splats.colors)],
            v_means2d: vec![Vec2::ZERO; n],
            v_kwh: vec![Mat3::ZERO; n],
            v_means2d_abs: vec![Vec2::ZERO; n],
        }
    }

    pub fn targets(&mut self) -> SplatGradTargets<'_> {
        SplatGradTargets {
            v_means: &mut self.v_means,
            v_scales: &mut self.v_scales,
            v_quats: &mut self.v_quats,
            v_opacities: &mut self.v_opacities,
            v_colors: &mut self.v_colors,
            v_means2d: &mut self.v_means2d,
            v_kwh: &mut self.v_kwh,
            v_means2d_abs: &mut self.v_means2d_abs,
        }
    }
}

/// Backpropagate the pixel gradients of a forward render to every splat parameter.
///
/// `splats` and `camera` must be the ones `session` was rendered with.
pub fn render_backward(
    splats: &SplatInputs<'_>,
    camera: &Camera,
    session: &RenderSession<'_>,
    pixel_grads: &PixelGrads<'_>,
    mut targets: SplatGradTargets<'_>,
) -> Result<(), RenderError> {
    splats.validate()?;
    session.check_inputs(splats, camera)?;
    pixel_grads.check(camera.num_pixels())?;
    targets.check(splats)?;

    let num_splats = splats.len();
    let _span = tracing::trace_span!("RenderBackward", num_splats).entered();

    let screen = rasterize_backward(session, camera, pixel_grads);
    let projected = session.geometry.projected;
    let config = &session.config;

    {
        let _span = tracing::trace_span!("ProjectBackward").entered();
        let stride = colors_per_splat(&splats.colors).max(1);
        targets
            .v_means
            .par_iter_mut()
            .zip(targets.v_scales.par_iter_mut())
            .zip(targets.v_quats.par_iter_mut())
            .zip(targets.v_colors.par_chunks_mut(stride))
            .enumerate()
            .for_each(|(idx, (((v_mean, v_scale), v_quat), v_colors))| {
                let grads = project_backward(
                    splats,
                    idx,
                    camera,
                    config,
                    &projected[idx],
                    &screen[idx],
                    v_colors,
                );
                *v_mean = grads.v_mean;
                *v_scale = grads.v_scale;
                *v_quat = grads.v_quat;
            });
    }

    targets
        .v_opacities
        .par_iter_mut()
        .zip(targets.v_means2d.par_iter_mut())
        .zip(targets.v_kwh.par_iter_mut())
        .zip(targets.v_means2d_abs.par_iter_mut())
        .enumerate()
        .for_each(|(idx, (((v_opacity, v_mean2d), v_kwh), v_abs))| {
            let grads = &screen[idx];
            *v_opacity = grads.v_opacity;
            *v_mean2d = grads.v_mean2d(projected[idx].depth());
            *v_kwh = grads.v_kwh;
            *v_abs = grads.v_xy_abs;
        });

    let non_finite = targets
        .v_means
        .par_iter()
        .zip(targets.v_scales.par_iter())
        .filter(|(m, s)| !m.is_finite() || !s.is_finite())
        .count();
    if non_finite > 0 {
        log::warn!("{non_finite} of {num_splats} splats have non-finite gradients");
    }

    Ok(())
}
