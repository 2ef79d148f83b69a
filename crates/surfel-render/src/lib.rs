//! Forward rendering of oriented 2D Gaussian surfels.
//!
//! A render runs in four stages, each a data-parallel pass over rayon:
//!
//! 1. [`project`] every splat into screen space and count the tiles it touches.
//! 2. [`intersects`]: write one `(tile, depth)` key per touched tile and sort them globally.
//! 3. Derive the range of sorted intersections belonging to each tile.
//! 4. [`rasterize`] every tile front to back.
//!
//! All intermediate buffers live in three caller-owned scratch arenas. The returned
//! [`RenderSession`] borrows them so the backward pass can replay the exact same work.

pub mod camera;
pub mod config;
pub mod distortion;
mod error;
pub mod intersects;
pub mod project;
pub mod rasterize;
pub mod render;
pub mod render_aux;
pub mod sh;
pub mod splats;
pub mod validation;
pub mod visibility;

#[cfg(test)]
mod tests;

pub use camera::Camera;
pub use config::{DistortionKind, RenderConfig};
pub use error::{RenderError, check_len};
pub use render::{RenderArenas, RenderImage, RenderTargets, SplatStats, render_forward};
pub use render_aux::RenderSession;
pub use splats::{FlatColors, SplatColors, SplatInputs};
pub use visibility::mark_visible;

pub const TILE_WIDTH: u32 = 16;
pub const TILE_SIZE: u32 = TILE_WIDTH * TILE_WIDTH;

/// Splats and intersections closer than this to the camera are not rendered.
pub const NEAR_PLANE: f32 = 0.2;
/// Blend weights below this are skipped.
pub const ALPHA_THRESHOLD: f32 = 1.0 / 255.0;
/// Per splat alpha is clamped to this to keep transmittance invertible.
pub const MAX_ALPHA: f32 = 0.99;
/// A pixel stops compositing once its transmittance would drop below this.
pub const MIN_TRANSMITTANCE: f32 = 1e-4;
/// Inverse squared radius of the screen space low pass filter.
pub const FILTER_INV_SQUARE: f32 = 2.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderStats {
    /// Splats that survived projection, the `R` a backward pass is paired with.
    pub num_visible: u32,
    pub num_intersections: u32,
}
