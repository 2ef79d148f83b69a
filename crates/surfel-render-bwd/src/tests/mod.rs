use glam::{Quat, UVec2, Vec3};
use rand::{RngExt, SeedableRng};
use surfel_render::camera::Camera;
use surfel_render::{
    RenderArenas, RenderConfig, RenderError, RenderImage, SplatColors, SplatInputs, render_forward,
};

use crate::render_bwd::{PixelGrads, SplatGrads, render_backward};


/// Owned splats, with either SH coefficients or one precomputed color per splat.
#[derive(Clone, Debug, Default)]
pub(crate) struct TestScene {
    pub means: Vec<Vec3>,
    pub scales: Vec<Vec3>,
    pub rotations: Vec<[f32; 4]>,
    pub opacities: Vec<f32>,
    pub colors: Vec<Vec3>,
    pub sh_degree: Option<u32>,
}

/// `[w, x, y, z]` rotation about `axis`.
pub(crate) fn axis_angle(axis: Vec3, angle: f32) -> [f32; 4] {
    let q = Quat::from_axis_angle(axis.normalize(), angle);
    [q.w, q.x, q.y, q.z]
}

impl TestScene {
    pub fn push(
        &mut self,
        mean: Vec3,
        scale: Vec3,
        rotation: [f32; 4],
        opacity: f32,
        colors: &[Vec3],
    ) -> &mut Self {
        self.means.push(mean);
        self.scales.push(scale);
        self.rotations.push(rotation);
        self.opacities.push(opacity);
        self.colors.extend_from_slice(colors);
        self
    }

    pub fn random(count: usize, seed: u64) -> Self {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let mut scene = Self::default();
        for _ in 0..count {
            let z = rng.random_range(1.5..6.0);
            let mean = Vec3::new(
                rng.random_range(-0.4..0.4) * z,
                rng.random_range(-0.4..0.4) * z,
                z,
            );
            let scale = Vec3::new(rng.random_range(0.05..0.4), rng.random_range(0.05..0.4), 0.01);
            let rotation: [f32; 4] = std::array::from_fn(|_| rng.random_range(-1.0..1.0));
            let color = Vec3::new(
                rng.random_range(0.0..1.0),
                rng.random_range(0.0..1.0),
                rng.random_range(0.0..1.0),
            );
            scene.push(mean, scale, rotation, rng.random_range(0.05..0.95), &[color]);
        }
        scene
    }

    pub fn inputs(&self) -> SplatInputs<'_> {
        let colors = match self.sh_degree {
            Some(degree) => SplatColors::Sh {
                degree,
                coeffs_per_splat: (self.colors.len() / self.means.len().max(1)) as u32,
                coeffs: &self.colors,
            },
            None => SplatColors::Precomputed(&self.colors),
        };
        SplatInputs {
            means: &self.means,
            scales: &self.scales,
            rotations: &self.rotations,
            opacities: &self.opacities,
            colors,
        }
    }
}

/// Camera at the origin looking down +z with the given focal length in pixels.
pub(crate) fn camera_with_focal(width: u32, height: u32, focal: f32) -> Camera {
    let fov_y = 2.0 * (0.5 * height as f32 / focal).atan();
    Camera::look_at(
        Vec3::ZERO,
        Vec3::Z,
        Vec3::NEG_Y,
        fov_y,
        UVec2::new(width, height),
    )
}

/// Weights of a linear loss over every output image.
#[derive(Clone, Debug)]
pub(crate) struct LossWeights {
    pub color: Vec<f32>,
    pub depth: Vec<f32>,
    pub normal: Vec<f32>,
    pub opacity: Vec<f32>,
    pub distortion: Vec<f32>,
}

impl LossWeights {
    pub fn zeros(num_pixels: usize) -> Self {
        Self {
            color: vec![0.0; 3 * num_pixels],
            depth: vec![0.0; num_pixels],
            normal: vec![0.0; 3 * num_pixels],
            opacity: vec![0.0; num_pixels],
            distortion: vec![0.0; num_pixels],
        }
    }

    pub fn random(num_pixels: usize, seed: u64) -> Self {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let mut weights = Self::zeros(num_pixels);
        for w in weights
            .color
            .iter_mut()
            .chain(&mut weights.depth)
            .chain(&mut weights.normal)
            .chain(&mut weights.opacity)
            .chain(&mut weights.distortion)
        {
            *w = rng.random_range(-1.0..1.0);
        }
        weights
    }

    pub fn pixel_grads(&self) -> PixelGrads<'_> {
        PixelGrads {
            v_color: &self.color,
            v_depth: &self.depth,
            v_normal: &self.normal,
            v_opacity: &self.opacity,
            v_distortion: &self.distortion,
        }
    }

    pub fn loss(&self, image: &RenderImage) -> f64 {
        let dot = |w: &[f32], v: &[f32]| {
            w.iter()
                .zip(v)
                .map(|(&a, &b)| f64::from(a) * f64::from(b))
                .sum::<f64>()
        };
        dot(&self.color, &image.color)
            + dot(&self.depth, &image.depth)
            + dot(&self.normal, &image.normal)
            + dot(&self.opacity, &image.opacity)
            + dot(&self.distortion, &image.distortion)
    }
}

pub(crate) fn render(scene: &TestScene, camera: &Camera, config: &RenderConfig) -> RenderImage {
    let inputs = scene.inputs();
    let mut image = RenderImage::new(camera.img_size, inputs.len());
    let mut geometry = Vec::<u64>::new();
    let mut binning = Vec::<u64>::new();
    let mut arena = Vec::<u64>::new();
    render_forward(
        &inputs,
        camera,
        config,
        RenderArenas {
            geometry: &mut geometry,
            binning: &mut binning,
            image: &mut arena,
        },
        image.targets(),
    )
    .expect("Valid render");
    image
}

/// Render, then backpropagate `weights` as the pixel gradients.
pub(crate) fn backward(
    scene: &TestScene,
    camera: &Camera,
    config: &RenderConfig,
    weights: &LossWeights,
) -> Result<SplatGrads, RenderError> {
    let inputs = scene.inputs();
    let mut image = RenderImage::new(camera.img_size, inputs.len());
    let mut geometry = Vec::<u64>::new();
    let mut binning = Vec::<u64>::new();
    let mut arena = Vec::<u64>::new();
    let session = render_forward(
        &inputs,
        camera,
        config,
        RenderArenas {
            geometry: &mut geometry,
            binning: &mut binning,
            image: &mut arena,
        },
        image.targets(),
    )?;
    let mut grads = SplatGrads::new(&inputs);
    render_backward(
        &inputs,
        camera,
        &session,
        &weights.pixel_grads(),
        grads.targets(),
    )?;
    Ok(grads)
}

/// Central difference of the loss for a perturbation applied by `edit`.
pub(crate) fn numeric_grad(
    scene: &TestScene,
    camera: &Camera,
    config: &RenderConfig,
    weights: &LossWeights,
    eps: f32,
    edit: impl Fn(&mut TestScene, f32),
) -> f32 {
    let mut plus = scene.clone();
    edit(&mut plus, eps);
    let mut minus = scene.clone();
    edit(&mut minus, -eps);
    let diff = weights.loss(&render(&plus, camera, config))
        - weights.loss(&render(&minus, camera, config));
    (diff / (2.0 * f64::from(eps))) as f32
}

#[track_caller]
pub(crate) fn assert_grad_close(name: &str, analytic: f32, numeric: f32) {
    let tol = 1e-2 + 5e-2 * analytic.abs();
    assert!(
        (analytic - numeric).abs() <= tol,
        "{name}: analytic {analytic}, numeric {numeric}"
    );
}
