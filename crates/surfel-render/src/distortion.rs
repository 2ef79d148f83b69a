//! Depth distortion regularizers.
//!
//! A distortion model measures how spread out the blend weights of one pixel are along depth.
//! Forward rasterization feeds it one composited splat at a time. The backward pass hands it the
//! final per-pixel moments and asks for the gradient with respect to one splat's blend weight and
//! intersection depth. Chaining through transmittance is left to the rasterizer.

/// Running weighted depth moments of one pixel.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DistortionMoments {
    /// `Σ w·m`
    pub m1: f32,
    /// `Σ w·m²`
    pub m2: f32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DistortionGrad {
    pub weight: f32,
    pub depth: f32,
}

pub trait DistortionModel: Send + Sync {
    /// Composite a splat with blend weight `weight` at `depth`, where `accum_weight` is the
    /// total weight composited before it. Returns the increment of the distortion term.
    fn forward_step(
        &self,
        weight: f32,
        depth: f32,
        accum_weight: f32,
        moments: &mut DistortionMoments,
    ) -> f32;

    /// Gradient of the pixel's final distortion with respect to one splat's weight and depth,
    /// given the moments and total weight at the end of compositing.
    fn backward_step(
        &self,
        weight: f32,
        depth: f32,
        final_weight: f32,
        final_moments: DistortionMoments,
        dl_ddistortion: f32,
    ) -> DistortionGrad;
}

/// `Σᵢ Σ_{j<i} wᵢ wⱼ (mᵢ - mⱼ)²` over depths normalized between `near` and `far`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NormalizedDepthDistortion {
    pub near: f32,
    pub far: f32,
}

impl Default for NormalizedDepthDistortion {
    fn default() -> Self {
        Self {
            near: 0.2,
            far: 100.0,
        }
    }
}

impl NormalizedDepthDistortion {
    /// Normalized depth and its derivative.
    #[inline]
    pub fn map_depth(&self, depth: f32) -> (f32, f32) {
        let (n, f) = (self.near, self.far);
        let m = f / (f - n) * (1.0 - n / depth);
        let dm_dd = f * n / ((f - n) * depth * depth);
        (m, dm_dd)
    }
}

impl DistortionModel for NormalizedDepthDistortion {
    #[inline]
    fn forward_step(
        &self,
        weight: f32,
        depth: f32,
        accum_weight: f32,
        moments: &mut DistortionMoments,
    ) -> f32 {
        let (m, _) = self.map_depth(depth);
        let inc = (m * m * accum_weight + moments.m2 - 2.0 * m * moments.m1) * weight;
        moments.m1 += weight * m;
        moments.m2 += weight * m * m;
        inc
    }

    #[inline]
    fn backward_step(
        &self,
        weight: f32,
        depth: f32,
        final_weight: f32,
        final_moments: DistortionMoments,
        dl_ddistortion: f32,
    ) -> DistortionGrad {
        let (m, dm_dd) = self.map_depth(depth);
        let DistortionMoments { m1, m2 } = final_moments;
        DistortionGrad {
            weight: (m2 + m * m * final_weight - 2.0 * m * m1) * dl_ddistortion,
            depth: 2.0 * weight * (m * final_weight - m1) * dl_ddistortion * dm_dd,
        }
    }
}

/// Disables the distortion term.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NoDistortion;

impl DistortionModel for NoDistortion {
    fn forward_step(&self, _: f32, _: f32, _: f32, _: &mut DistortionMoments) -> f32 {
        0.0
    }

    fn backward_step(
        &self,
        _: f32,
        _: f32,
        _: f32,
        _: DistortionMoments,
        _: f32,
    ) -> DistortionGrad {
        DistortionGrad::default()
    }
}

#[cfg(test)]
mod tests {
    use super::{DistortionModel, DistortionMoments, NormalizedDepthDistortion};
    use assert_approx_eq::assert_approx_eq;

    fn total(model: &NormalizedDepthDistortion, weights: &[f32], depths: &[f32]) -> f32 {
        let mut moments = DistortionMoments::default();
        let mut accum = 0.0;
        let mut dist = 0.0;
        for (&w, &d) in weights.iter().zip(depths) {
            dist += model.forward_step(w, d, accum, &mut moments);
            accum += w;
        }
        dist
    }

    #[test]
    fn matches_pairwise_sum() {
        let model = NormalizedDepthDistortion::default();
        let weights = [0.3, 0.2, 0.4];
        let depths = [1.0, 2.5, 7.0];
        let m: Vec<f32> = depths.iter().map(|&d| model.map_depth(d).0).collect();
        let mut pairwise = 0.0;
        for i in 0..3 {
            for j in 0..i {
                pairwise += weights[i] * weights[j] * (m[i] - m[j]).powi(2);
            }
        }
        assert_approx_eq!(total(&model, &weights, &depths), pairwise, 1e-6);
    }

    #[test]
    fn single_depth_has_no_distortion() {
        let model = NormalizedDepthDistortion::default();
        assert_approx_eq!(total(&model, &[0.5, 0.3], &[3.0, 3.0]), 0.0, 1e-7);
    }

    #[test]
    fn backward_matches_finite_difference() {
        let model = NormalizedDepthDistortion::default();
        let weights = [0.3, 0.2, 0.4];
        let depths = [1.0, 2.5, 7.0];
        let final_weight: f32 = weights.iter().sum();
        let mut moments = DistortionMoments::default();
        let mut accum = 0.0;
        for (&w, &d) in weights.iter().zip(&depths) {
            model.forward_step(w, d, accum, &mut moments);
            accum += w;
        }

        let k = 1;
        let grad = model.backward_step(weights[k], depths[k], final_weight, moments, 1.0);

        let eps = 1e-3;
        let mut wp = weights;
        let mut wm = weights;
        wp[k] += eps;
        wm[k] -= eps;
        let num_w = (total(&model, &wp, &depths) - total(&model, &wm, &depths)) / (2.0 * eps);
        assert_approx_eq!(grad.weight, num_w, 1e-3);

        let mut dp = depths;
        let mut dm = depths;
        dp[k] += eps;
        dm[k] -= eps;
        let num_d = (total(&model, &weights, &dp) - total(&model, &weights, &dm)) / (2.0 * eps);
        assert_approx_eq!(grad.depth, num_d, 1e-3);
    }
}
