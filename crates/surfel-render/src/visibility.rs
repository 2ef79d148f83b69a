use glam::Vec3;
use rayon::prelude::*;

use crate::camera::Camera;
use crate::error::check_len;
use crate::{NEAR_PLANE, RenderError};

/// View space position of `mean` if it is finite and past the near plane.
#[inline]
pub fn in_front(mean: Vec3, camera: &Camera) -> Option<Vec3> {
    let p_view = camera.world_to_view(mean);
    (p_view.is_finite() && p_view.z > NEAR_PLANE).then_some(p_view)
}

/// View space position of `mean` if it passes the near plane and homogeneous divide checks.
#[inline]
pub fn in_frustum(mean: Vec3, camera: &Camera) -> Option<Vec3> {
    let p_view = in_front(mean, camera)?;
    let clip = camera.full_proj * mean.extend(1.0);
    if !clip.w.is_finite() || clip.w.abs() < f32::EPSILON {
        return None;
    }
    let ndc = clip.truncate() / clip.w;
    ndc.is_finite().then_some(p_view)
}

/// Mark which splat centers are present in the camera's view.
pub fn mark_visible(
    means: &[Vec3],
    camera: &Camera,
    present: &mut [bool],
) -> Result<(), RenderError> {
    check_len("present", present, means.len())?;
    let _span = tracing::trace_span!("MarkVisible").entered();
    present
        .par_iter_mut()
        .zip(means.par_iter())
        .for_each(|(present, &mean)| *present = in_frustum(mean, camera).is_some());
    Ok(())
}
