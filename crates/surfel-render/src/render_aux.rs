//! Typed layouts of the three scratch arenas and the session handed from forward to backward.
//!
//! Every arena is a sequence of word aligned views, carved in the order listed here:
//!
//! - geometry, sized by the splat count `P`: `projected: [ProjectedSplat; P]`,
//!   `tiles_touched: [u32; P]`, `cum_tiles_hit: [u32; P]`.
//! - binning, sized by the intersection count `N`: `keys: [u64; N]`, `values: [u32; N]` and the
//!   same again as sort scratch. After sorting the first two hold the result.
//! - image, sized by the tile count and pixel count: `header: SessionHeader`,
//!   `ranges: [[u32; 2]; tiles]`, `final_t: [f32; px]`, `n_contrib: [u32; px]`,
//!   `last_contributor: [u32; px]`, `moments: [DistortionMoments; px]`.
//!
//! `N` isn't stored anywhere, it's the last entry of `cum_tiles_hit`.

use glam::UVec2;
use surfel_kernel::{ArenaCarver, ArenaError, ArenaLayout, ArenaReader};

use crate::camera::Camera;
use crate::config::RenderConfig;
use crate::distortion::DistortionMoments;
use crate::project::ProjectedSplat;
use crate::splats::SplatInputs;
use crate::{RenderError, RenderStats};

pub struct GeometryState<'a> {
    pub projected: &'a mut [ProjectedSplat],
    pub tiles_touched: &'a mut [u32],
    pub cum_tiles_hit: &'a mut [u32],
}

impl<'a> GeometryState<'a> {
    pub const fn layout(num_splats: usize) -> ArenaLayout {
        ArenaLayout::new()
            .with::<ProjectedSplat>(num_splats)
            .with::<u32>(num_splats)
            .with::<u32>(num_splats)
    }

    pub fn carve(words: &'a mut [u64], num_splats: usize) -> Result<Self, ArenaError> {
        let mut carver = ArenaCarver::new(words);
        Ok(Self {
            projected: carver.take(num_splats)?,
            tiles_touched: carver.take(num_splats)?,
            cum_tiles_hit: carver.take(num_splats)?,
        })
    }
}

#[derive(Clone, Copy, Debug)]
pub struct GeometryView<'a> {
    pub projected: &'a [ProjectedSplat],
    pub tiles_touched: &'a [u32],
    pub cum_tiles_hit: &'a [u32],
}

impl<'a> GeometryView<'a> {
    pub fn read(words: &'a [u64], num_splats: usize) -> Result<Self, ArenaError> {
        let mut reader = ArenaReader::new(words);
        Ok(Self {
            projected: reader.take(num_splats)?,
            tiles_touched: reader.take(num_splats)?,
            cum_tiles_hit: reader.take(num_splats)?,
        })
    }

    pub fn num_intersections(&self) -> u32 {
        self.cum_tiles_hit.last().copied().unwrap_or(0)
    }

    pub fn num_visible(&self) -> u32 {
        self.projected.iter().filter(|p| p.is_visible()).count() as u32
    }
}

pub struct BinningState<'a> {
    pub keys: &'a mut [u64],
    pub values: &'a mut [u32],
    pub scratch_keys: &'a mut [u64],
    pub scratch_values: &'a mut [u32],
}

impl<'a> BinningState<'a> {
    pub const fn layout(num_intersections: usize) -> ArenaLayout {
        ArenaLayout::new()
            .with::<u64>(num_intersections)
            .with::<u32>(num_intersections)
            .with::<u64>(num_intersections)
            .with::<u32>(num_intersections)
    }

    pub fn carve(words: &'a mut [u64], num_intersections: usize) -> Result<Self, ArenaError> {
        let mut carver = ArenaCarver::new(words);
        Ok(Self {
            keys: carver.take(num_intersections)?,
            values: carver.take(num_intersections)?,
            scratch_keys: carver.take(num_intersections)?,
            scratch_values: carver.take(num_intersections)?,
        })
    }
}

/// The sorted intersections.
#[derive(Clone, Copy, Debug)]
pub struct BinningView<'a> {
    pub keys: &'a [u64],
    /// Splat index of every sorted intersection.
    pub values: &'a [u32],
}

impl<'a> BinningView<'a> {
    pub fn read(words: &'a [u64], num_intersections: usize) -> Result<Self, ArenaError> {
        let mut reader = ArenaReader::new(words);
        Ok(Self {
            keys: reader.take(num_intersections)?,
            values: reader.take(num_intersections)?,
        })
    }
}

/// Fingerprints of the camera and options a forward render ran with, stored at the start of the
/// image arena.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct SessionHeader {
    pub camera: u64,
    pub config: u64,
}

impl SessionHeader {
    pub fn new(camera: &Camera, config: &RenderConfig) -> Self {
        Self {
            camera: camera.fingerprint(),
            config: config.fingerprint(),
        }
    }
}

pub struct ImageState<'a> {
    pub header: &'a mut SessionHeader,
    pub ranges: &'a mut [[u32; 2]],
    pub final_t: &'a mut [f32],
    pub n_contrib: &'a mut [u32],
    pub last_contributor: &'a mut [u32],
    pub moments: &'a mut [DistortionMoments],
}

impl<'a> ImageState<'a> {
    pub const fn layout(num_tiles: usize, num_pixels: usize) -> ArenaLayout {
        ArenaLayout::new()
            .with::<SessionHeader>(1)
            .with::<[u32; 2]>(num_tiles)
            .with::<f32>(num_pixels)
            .with::<u32>(num_pixels)
            .with::<u32>(num_pixels)
            .with::<DistortionMoments>(num_pixels)
    }

    pub fn carve(
        words: &'a mut [u64],
        num_tiles: usize,
        num_pixels: usize,
    ) -> Result<Self, ArenaError> {
        let mut carver = ArenaCarver::new(words);
        Ok(Self {
            header: &mut carver.take::<SessionHeader>(1)?[0],
            ranges: carver.take(num_tiles)?,
            final_t: carver.take(num_pixels)?,
            n_contrib: carver.take(num_pixels)?,
            last_contributor: carver.take(num_pixels)?,
            moments: carver.take(num_pixels)?,
        })
    }
}

/// Per pixel state the backward pass replays from.
#[derive(Clone, Copy, Debug)]
pub struct ImageView<'a> {
    pub header: SessionHeader,
    pub ranges: &'a [[u32; 2]],
    /// Transmittance left after compositing, before the background.
    pub final_t: &'a [f32],
    /// Splats actually composited.
    pub n_contrib: &'a [u32],
    /// Number of entries of the tile range the pixel walked through, including skipped ones.
    pub last_contributor: &'a [u32],
    pub moments: &'a [DistortionMoments],
}

impl<'a> ImageView<'a> {
    pub fn read(words: &'a [u64], num_tiles: usize, num_pixels: usize) -> Result<Self, ArenaError> {
        let mut reader = ArenaReader::new(words);
        Ok(Self {
            header: reader.take::<SessionHeader>(1)?[0],
            ranges: reader.take(num_tiles)?,
            final_t: reader.take(num_pixels)?,
            n_contrib: reader.take(num_pixels)?,
            last_contributor: reader.take(num_pixels)?,
            moments: reader.take(num_pixels)?,
        })
    }
}

/// Everything a forward render leaves behind for its backward pass.
///
/// Borrows the scratch arenas, so they can't be touched until the session is dropped.
#[derive(Clone, Debug)]
pub struct RenderSession<'a> {
    pub num_splats: usize,
    pub sh_dims: (u32, u32),
    pub img_size: UVec2,
    pub camera_fingerprint: u64,
    pub config: RenderConfig,
    pub stats: RenderStats,
    pub geometry: GeometryView<'a>,
    pub binning: BinningView<'a>,
    pub image: ImageView<'a>,
}

impl<'a> RenderSession<'a> {
    /// Rebuild a session from arenas a forward render filled in.
    ///
    /// `num_visible` is the count that forward render reported. It is checked against the
    /// projected splats, together with the arena sizes and the camera and options recorded in the
    /// image arena, to catch arenas that were reused or paired with the wrong inputs.
    pub fn restore(
        splats: &SplatInputs<'_>,
        camera: &Camera,
        config: &RenderConfig,
        num_visible: u32,
        geometry: &'a [u64],
        binning: &'a [u64],
        image: &'a [u64],
    ) -> Result<Self, RenderError> {
        let num_splats = splats.len();
        let geometry = GeometryView::read(geometry, num_splats)?;
        let num_intersections = geometry.num_intersections();
        let binning = BinningView::read(binning, num_intersections as usize)?;
        let tile_bounds = camera.tile_bounds();
        let image = ImageView::read(
            image,
            (tile_bounds.x * tile_bounds.y) as usize,
            camera.num_pixels(),
        )?;

        let found_visible = geometry.num_visible();
        if found_visible != num_visible {
            return Err(RenderError::SessionMismatch(format!(
                "forward reported {num_visible} visible splats, arena holds {found_visible}"
            )));
        }
        let expected = SessionHeader::new(camera, config);
        if image.header.camera != expected.camera {
            return Err(RenderError::SessionMismatch(
                "camera differs from the rendered one".to_owned(),
            ));
        }
        if image.header.config != expected.config {
            return Err(RenderError::SessionMismatch(
                "render options differ from the rendered ones".to_owned(),
            ));
        }

        Ok(Self {
            num_splats,
            sh_dims: splats.sh_dims(),
            img_size: camera.img_size,
            camera_fingerprint: expected.camera,
            config: config.clone(),
            stats: RenderStats {
                num_visible,
                num_intersections,
            },
            geometry,
            binning,
            image,
        })
    }

    /// Check the inputs of a backward pass match the render this session came from.
    pub fn check_inputs(
        &self,
        splats: &SplatInputs<'_>,
        camera: &Camera,
    ) -> Result<(), RenderError> {
        if splats.len() != self.num_splats {
            return Err(RenderError::SessionMismatch(format!(
                "rendered {} splats, got {}",
                self.num_splats,
                splats.len()
            )));
        }
        if splats.sh_dims() != self.sh_dims {
            return Err(RenderError::SessionMismatch(format!(
                "rendered with SH dims {:?}, got {:?}",
                self.sh_dims,
                splats.sh_dims()
            )));
        }
        if camera.fingerprint() != self.camera_fingerprint {
            return Err(RenderError::SessionMismatch(
                "camera differs from the rendered one".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn num_visible(&self) -> u32 {
        self.stats.num_visible
    }

    pub fn tile_bounds(&self) -> UVec2 {
        crate::camera::calc_tile_bounds(self.img_size)
    }
}
