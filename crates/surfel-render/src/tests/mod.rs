use glam::{UVec2, Vec3};
use rand::{RngExt, SeedableRng};

use crate::camera::Camera;
use crate::render::{RenderArenas, RenderImage};
use crate::splats::{SplatColors, SplatInputs};

mod render;

/// Owned splat buffers to build test inputs from.
#[derive(Clone, Debug, Default)]
pub(crate) struct TestSplats {
    pub means: Vec<Vec3>,
    pub scales: Vec<Vec3>,
    pub rotations: Vec<[f32; 4]>,
    pub opacities: Vec<f32>,
    pub colors: Vec<Vec3>,
}

impl TestSplats {
    pub fn push(&mut self, mean: Vec3, scale: Vec3, opacity: f32, color: Vec3) -> &mut Self {
        self.means.push(mean);
        self.scales.push(scale);
        self.rotations.push([1.0, 0.0, 0.0, 0.0]);
        self.opacities.push(opacity);
        self.colors.push(color);
        self
    }

    /// `count` splats scattered in front of a camera at the origin looking down +z.
    pub fn random(count: usize, seed: u64) -> Self {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let mut splats = Self::default();
        for _ in 0..count {
            let z = rng.random_range(1.0..8.0);
            let mean = Vec3::new(
                rng.random_range(-0.6..0.6) * z,
                rng.random_range(-0.5..0.5) * z,
                z,
            );
            let scale = Vec3::new(
                rng.random_range(0.005..0.2),
                rng.random_range(0.005..0.2),
                0.01,
            );
            let q: [f32; 4] = std::array::from_fn(|_| rng.random_range(-1.0..1.0));
            splats.means.push(mean);
            splats.scales.push(scale);
            splats.rotations.push(q);
            splats.opacities.push(rng.random_range(0.0..1.0));
            splats.colors.push(Vec3::new(
                rng.random_range(0.0..1.0),
                rng.random_range(0.0..1.0),
                rng.random_range(0.0..1.0),
            ));
        }
        splats
    }

    pub fn inputs(&self) -> SplatInputs<'_> {
        SplatInputs {
            means: &self.means,
            scales: &self.scales,
            rotations: &self.rotations,
            opacities: &self.opacities,
            colors: SplatColors::Precomputed(&self.colors),
        }
    }
}

#[derive(Default)]
pub(crate) struct TestArenas {
    pub geometry: Vec<u64>,
    pub binning: Vec<u64>,
    pub image: Vec<u64>,
}

impl TestArenas {
    pub fn arenas(&mut self) -> RenderArenas<'_> {
        RenderArenas {
            geometry: &mut self.geometry,
            binning: &mut self.binning,
            image: &mut self.image,
        }
    }
}

/// Camera at the origin looking down +z.
pub(crate) fn front_camera(width: u32, height: u32, fov_y: f32) -> Camera {
    Camera::look_at(
        Vec3::ZERO,
        Vec3::Z,
        Vec3::NEG_Y,
        fov_y,
        UVec2::new(width, height),
    )
}

pub(crate) fn new_image(camera: &Camera, splats: &TestSplats) -> RenderImage {
    RenderImage::new(camera.img_size, splats.means.len())
}
