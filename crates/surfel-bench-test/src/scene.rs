use glam::Vec3;
use rand::{RngExt, SeedableRng};
use surfel_render::sh::{rgb_to_sh, sh_coeffs_for_degree};
use surfel_render::{SplatColors, SplatInputs};

/// Splats scattered in a frustum in front of a camera at the origin looking down +z.
pub struct RandomScene {
    means: Vec<Vec3>,
    scales: Vec<Vec3>,
    rotations: Vec<[f32; 4]>,
    opacities: Vec<f32>,
    coeffs: Vec<Vec3>,
    sh_degree: u32,
}

impl RandomScene {
    pub fn new(count: usize, sh_degree: u32, seed: u64) -> Self {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let coeffs_per_splat = sh_coeffs_for_degree(sh_degree) as usize;

        let mut scene = Self {
            means: Vec::with_capacity(count),
            scales: Vec::with_capacity(count),
            rotations: Vec::with_capacity(count),
            opacities: Vec::with_capacity(count),
            coeffs: Vec::with_capacity(count * coeffs_per_splat),
            sh_degree,
        };

        for _ in 0..count {
            let z = rng.random_range(1.0..20.0);
            scene.means.push(Vec3::new(
                rng.random_range(-0.5..0.5) * z,
                rng.random_range(-0.5..0.5) * z,
                z,
            ));
            let size = rng.random_range(0.01..0.2) * z.sqrt();
            scene.scales.push(Vec3::new(
                size * rng.random_range(0.3..1.0),
                size * rng.random_range(0.3..1.0),
                0.0,
            ));
            scene
                .rotations
                .push(std::array::from_fn(|_| rng.random_range(-1.0..1.0)));
            scene.opacities.push(rng.random_range(0.05..1.0));

            let base = Vec3::new(
                rng.random_range(0.0..1.0),
                rng.random_range(0.0..1.0),
                rng.random_range(0.0..1.0),
            );
            scene.coeffs.push(rgb_to_sh(base));
            for _ in 1..coeffs_per_splat {
                scene.coeffs.push(Vec3::new(
                    rng.random_range(-0.1..0.1),
                    rng.random_range(-0.1..0.1),
                    rng.random_range(-0.1..0.1),
                ));
            }
        }
        scene
    }

    pub fn inputs(&self) -> SplatInputs<'_> {
        SplatInputs {
            means: &self.means,
            scales: &self.scales,
            rotations: &self.rotations,
            opacities: &self.opacities,
            colors: SplatColors::Sh {
                degree: self.sh_degree,
                coeffs_per_splat: sh_coeffs_for_degree(self.sh_degree),
                coeffs: &self.coeffs,
            },
        }
    }
}

/// Random color gradients standing in for a loss.
pub fn pixel_weights(num_pixels: usize, seed: u64) -> Vec<f32> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed ^ 0x9e37_79b9);
    (0..3 * num_pixels)
        .map(|_| rng.random_range(-1.0..1.0))
        .collect()
}
