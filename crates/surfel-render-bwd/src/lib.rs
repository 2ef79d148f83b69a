//! Backward pass of the surfel renderer.
//!
//! Given a [`RenderSession`](surfel_render::RenderSession) and the gradient of a loss with
//! respect to every output image, computes the gradient with respect to every splat parameter.
//! Rasterization runs backward per tile and gathers screen space gradients per splat, which are
//! then chained back through the projection per splat.

mod project_bwd;
mod rasterize_bwd;
mod render_bwd;

#[cfg(test)]
mod tests;

pub use project_bwd::{normalize_quat_vjp, quat_to_mat_vjp};
pub use rasterize_bwd::{ScreenGrads, rasterize_backward};
pub use render_bwd::{PixelGrads, SplatGradTargets, SplatGrads, render_backward};
