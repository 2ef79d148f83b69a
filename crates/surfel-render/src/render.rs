use std::sync::atomic::Ordering;

use glam::{UVec2, Vec3};
use rayon::prelude::*;
use surfel_kernel::{ScratchArena, read_accumulators};
use surfel_prefix_sum::prefix_sum;

use crate::camera::Camera;
use crate::config::RenderConfig;
use crate::error::check_len;
use crate::intersects::{get_tile_offsets, map_splats_to_intersects, sort_intersects};
use crate::project::project_splats;
use crate::rasterize::{PixelState, PixelTargets, SplatAccumulators, rasterize_forward};
use crate::render_aux::{
    BinningState, BinningView, GeometryState, GeometryView, ImageState, ImageView, RenderSession,
    SessionHeader,
};
use crate::splats::SplatInputs;
use crate::validation::validate_session;
use crate::{RenderError, RenderStats};

/// The three scratch arenas a render carves its intermediate buffers from.
pub struct RenderArenas<'a> {
    pub geometry: &'a mut dyn ScratchArena,
    pub binning: &'a mut dyn ScratchArena,
    pub image: &'a mut dyn ScratchArena,
}

/// Caller buffers for the per splat statistics of a render.
pub struct SplatStatsTargets<'a> {
    /// Total blend weight over all pixels.
    pub weight_sum: &'a mut [f32],
    /// Largest blend weight in any pixel.
    pub max_weight: &'a mut [f32],
    /// Number of pixels the splat was composited into.
    pub pixel_count: &'a mut [u32],
}

/// Caller buffers a render writes. Images are planar, `[C][H][W]`.
pub struct RenderTargets<'a> {
    pub color: &'a mut [f32],
    pub depth: &'a mut [f32],
    pub normal: &'a mut [f32],
    pub opacity: &'a mut [f32],
    pub distortion: &'a mut [f32],
    /// Screen space radius of every splat, 0 if culled.
    pub radii: Option<&'a mut [u32]>,
    pub stats: Option<SplatStatsTargets<'a>>,
}

impl RenderTargets<'_> {
    fn check(&self, num_pixels: usize, num_splats: usize) -> Result<(), RenderError> {
        check_len("out_color", self.color, 3 * num_pixels)?;
        check_len("out_depth", self.depth, num_pixels)?;
        check_len("out_normal", self.normal, 3 * num_pixels)?;
        check_len("out_opacity", self.opacity, num_pixels)?;
        check_len("out_distortion", self.distortion, num_pixels)?;
        if let Some(radii) = &self.radii {
            check_len("radii", radii, num_splats)?;
        }
        if let Some(stats) = &self.stats {
            check_len("weight_sum", stats.weight_sum, num_splats)?;
            check_len("max_weight", stats.max_weight, num_splats)?;
            check_len("pixel_count", stats.pixel_count, num_splats)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SplatStats {
    pub weight_sum: Vec<f32>,
    pub max_weight: Vec<f32>,
    pub pixel_count: Vec<u32>,
}

/// Owned render outputs, for callers that don't manage their own buffers.
#[derive(Clone, Debug)]
pub struct RenderImage {
    pub img_size: UVec2,
    pub color: Vec<f32>,
    pub depth: Vec<f32>,
    pub normal: Vec<f32>,
    pub opacity: Vec<f32>,
    pub distortion: Vec<f32>,
    pub radii: Vec<u32>,
    pub stats: SplatStats,
}

impl RenderImage {
    pub fn new(img_size: UVec2, num_splats: usize) -> Self {
        let num_pixels = img_size.x as usize * img_size.y as usize;
        Self {
            img_size,
            color: vec![0.0; 3 * num_pixels],
            depth: vec![0.0; num_pixels],
            normal: vec![0.0; 3 * num_pixels],
            opacity: vec![0.0; num_pixels],
            distortion: vec![0.0; num_pixels],
            radii: vec![0; num_splats],
            stats: SplatStats {
                weight_sum: vec![0.0; num_splats],
                max_weight: vec![0.0; num_splats],
                pixel_count: vec![0; num_splats],
            },
        }
    }

    pub fn targets(&mut self) -> RenderTargets<'_> {
        RenderTargets {
            color: &mut self.color,
            depth: &mut self.depth,
            normal: &mut self.normal,
            opacity: &mut self.opacity,
            distortion: &mut self.distortion,
            radii: Some(&mut self.radii),
            stats: Some(SplatStatsTargets {
                weight_sum: &mut self.stats.weight_sum,
                max_weight: &mut self.stats.max_weight,
                pixel_count: &mut self.stats.pixel_count,
            }),
        }
    }

    fn pixel_index(&self, x: u32, y: u32) -> usize {
        (x + y * self.img_size.x) as usize
    }

    fn num_pixels(&self) -> usize {
        self.depth.len()
    }

    pub fn color_at(&self, x: u32, y: u32) -> Vec3 {
        let (i, n) = (self.pixel_index(x, y), self.num_pixels());
        Vec3::new(self.color[i], self.color[n + i], self.color[2 * n + i])
    }

    pub fn normal_at(&self, x: u32, y: u32) -> Vec3 {
        let (i, n) = (self.pixel_index(x, y), self.num_pixels());
        Vec3::new(self.normal[i], self.normal[n + i], self.normal[2 * n + i])
    }

    pub fn depth_at(&self, x: u32, y: u32) -> f32 {
        self.depth[self.pixel_index(x, y)]
    }

    pub fn opacity_at(&self, x: u32, y: u32) -> f32 {
        self.opacity[self.pixel_index(x, y)]
    }
}

/// Render `splats` from `camera`.
///
/// Projects, bins, sorts and rasterizes the splats, writing the images into `targets`. The
/// returned session borrows the arenas and holds everything a backward pass needs to replay
/// this render.
pub fn render_forward<'a>(
    splats: &SplatInputs<'_>,
    camera: &Camera,
    config: &RenderConfig,
    arenas: RenderArenas<'a>,
    targets: RenderTargets<'_>,
) -> Result<RenderSession<'a>, RenderError> {
    config.validate()?;
    splats.validate()?;
    let img_size = camera.img_size;
    if img_size.x == 0 || img_size.y == 0 {
        return Err(RenderError::EmptyImage {
            width: img_size.x,
            height: img_size.y,
        });
    }
    let num_splats = splats.len();
    let num_pixels = camera.num_pixels();
    targets.check(num_pixels, num_splats)?;

    let tile_bounds = camera.tile_bounds();
    let num_tiles = tile_bounds.x * tile_bounds.y;

    let _span = tracing::trace_span!("RenderForward", num_splats).entered();

    let RenderArenas {
        geometry,
        binning,
        image,
    } = arenas;

    let geometry_words = geometry.obtain(GeometryState::layout(num_splats).bytes())?;
    let geom = GeometryState::carve(&mut *geometry_words, num_splats)?;

    {
        let _span = tracing::trace_span!("Project").entered();
        project_splats(splats, camera, config, geom.projected);
        geom.tiles_touched
            .par_iter_mut()
            .zip(geom.projected.par_iter())
            .for_each(|(count, p)| *count = p.tiles_touched);
    }

    let total: u64 = geom.tiles_touched.par_iter().map(|&t| u64::from(t)).sum();
    let num_intersections =
        u32::try_from(total).map_err(|_err| RenderError::TooManyIntersections(total))?;
    {
        let _span = tracing::trace_span!("PrefixSum").entered();
        prefix_sum(geom.tiles_touched, geom.cum_tiles_hit);
    }

    let num_visible = geom.projected.par_iter().filter(|p| p.is_visible()).count() as u32;
    if num_visible == 0 && num_splats > 0 {
        log::warn!("None of the {num_splats} splats are visible");
    }

    if let Some(radii) = targets.radii {
        radii
            .par_iter_mut()
            .zip(geom.projected.par_iter())
            .for_each(|(r, p)| *r = p.radius);
    }

    let binning_words =
        binning.obtain(BinningState::layout(num_intersections as usize).bytes())?;
    let bins = BinningState::carve(&mut *binning_words, num_intersections as usize)?;
    map_splats_to_intersects(
        geom.projected,
        geom.cum_tiles_hit,
        tile_bounds,
        bins.keys,
        bins.values,
    );
    sort_intersects(
        bins.keys,
        bins.values,
        bins.scratch_keys,
        bins.scratch_values,
        num_tiles,
    );

    let image_words = image.obtain(ImageState::layout(num_tiles as usize, num_pixels).bytes())?;
    let img = ImageState::carve(&mut *image_words, num_tiles as usize, num_pixels)?;
    *img.header = SessionHeader::new(camera, config);
    get_tile_offsets(bins.keys, img.ranges);

    let accumulators = targets
        .stats
        .is_some()
        .then(|| SplatAccumulators::new(num_splats));
    let distortion = config.distortion_model();
    rasterize_forward(
        geom.projected,
        bins.values,
        img.ranges,
        camera,
        config.sigma,
        distortion.as_ref(),
        PixelState {
            final_t: img.final_t,
            n_contrib: img.n_contrib,
            last_contributor: img.last_contributor,
            moments: img.moments,
        },
        PixelTargets {
            color: targets.color,
            depth: targets.depth,
            normal: targets.normal,
            opacity: targets.opacity,
            distortion: targets.distortion,
        },
        accumulators.as_ref(),
    );

    if let (Some(acc), Some(out)) = (accumulators, targets.stats) {
        read_accumulators(&acc.weight_sum, out.weight_sum);
        read_accumulators(&acc.max_weight, out.max_weight);
        for (o, a) in out.pixel_count.iter_mut().zip(&acc.pixel_count) {
            *o = a.load(Ordering::Relaxed);
        }
    }

    log::debug!(
        "Rendered {num_splats} splats at {}x{}: {num_visible} visible, {num_intersections} hits",
        img_size.x,
        img_size.y
    );

    let session = RenderSession {
        num_splats,
        sh_dims: splats.sh_dims(),
        img_size,
        camera_fingerprint: camera.fingerprint(),
        config: config.clone(),
        stats: RenderStats {
            num_visible,
            num_intersections,
        },
        geometry: GeometryView::read(geometry_words, num_splats)?,
        binning: BinningView::read(binning_words, num_intersections as usize)?,
        image: ImageView::read(image_words, num_tiles as usize, num_pixels)?,
    };

    if config.validation_enabled() {
        validate_session(&session);
    }

    Ok(session)
}
