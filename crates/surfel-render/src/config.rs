use clap::{Args, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::RenderError;
use crate::camera::fnv1a;
use crate::distortion::{DistortionModel, NoDistortion, NormalizedDepthDistortion};

#[derive(
    Default, ValueEnum, Clone, Copy, Eq, PartialEq, Debug, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum DistortionKind {
    /// Pairwise squared distance of depths mapped to [0, 1] between the near and far planes.
    #[default]
    NormalizedDepth,
    /// Don't accumulate a distortion term.
    None,
}

#[derive(Clone, Debug, PartialEq, Args, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RenderConfig {
    /// Uniform multiplier on every splat scale, applied at render time.
    #[arg(long, help_heading = "Render options", default_value = "1.0")]
    pub scale_modifier: f32,
    /// Falloff sharpness of the splat Gaussian. Higher values give sharper splats.
    #[arg(long, help_heading = "Render options", default_value = "1.0")]
    pub sigma: f32,
    /// Trust the caller's visibility culling and skip the frustum check.
    #[arg(long, help_heading = "Render options", default_value = "false")]
    pub prefiltered: bool,
    /// Depth distortion regularizer to accumulate.
    #[arg(
        long,
        value_enum,
        help_heading = "Render options",
        default_value = "normalized-depth"
    )]
    pub distortion: DistortionKind,
    /// Near plane of the distortion depth normalization.
    #[arg(long, help_heading = "Render options", default_value = "0.2")]
    pub distortion_near: f32,
    /// Far plane of the distortion depth normalization.
    #[arg(long, help_heading = "Render options", default_value = "100.0")]
    pub distortion_far: f32,
    /// Check intermediate buffers for invariant violations after every stage.
    #[arg(long, help_heading = "Render options", default_value = "false")]
    pub debug: bool,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            scale_modifier: 1.0,
            sigma: 1.0,
            prefiltered: false,
            distortion: DistortionKind::NormalizedDepth,
            distortion_near: 0.2,
            distortion_far: 100.0,
            debug: false,
        }
    }
}

impl RenderConfig {
    pub fn validate(&self) -> Result<(), RenderError> {
        if !(self.sigma > 0.0 && self.sigma.is_finite()) {
            return Err(RenderError::Config(format!(
                "sigma must be positive, got {}",
                self.sigma
            )));
        }
        if !(self.scale_modifier >= 0.0 && self.scale_modifier.is_finite()) {
            return Err(RenderError::Config(format!(
                "scale modifier must be non-negative, got {}",
                self.scale_modifier
            )));
        }
        if self.distortion == DistortionKind::NormalizedDepth
            && !(self.distortion_near > 0.0 && self.distortion_far > self.distortion_near)
        {
            return Err(RenderError::Config(format!(
                "distortion planes must satisfy 0 < near < far, got {} / {}",
                self.distortion_near, self.distortion_far
            )));
        }
        Ok(())
    }

    pub fn distortion_model(&self) -> Box<dyn DistortionModel> {
        match self.distortion {
            DistortionKind::NormalizedDepth => Box::new(NormalizedDepthDistortion {
                near: self.distortion_near,
                far: self.distortion_far,
            }),
            DistortionKind::None => Box::new(NoDistortion),
        }
    }

    /// Bit pattern summary of every option that changes the rendered result.
    pub fn fingerprint(&self) -> u64 {
        let distortion = match self.distortion {
            DistortionKind::NormalizedDepth => 0,
            DistortionKind::None => 1,
        };
        fnv1a([
            self.scale_modifier.to_bits(),
            self.sigma.to_bits(),
            u32::from(self.prefiltered),
            distortion,
            self.distortion_near.to_bits(),
            self.distortion_far.to_bits(),
        ])
    }

    pub(crate) fn validation_enabled(&self) -> bool {
        self.debug || cfg!(any(test, feature = "debug-validation"))
    }
}

#[cfg(test)]
mod tests {
    use super::{DistortionKind, RenderConfig};

    #[test]
    fn rejects_bad_values() {
        assert!(RenderConfig::default().validate().is_ok(), "Defaults are valid");
        let bad_sigma = RenderConfig {
            sigma: 0.0,
            ..Default::default()
        };
        assert!(bad_sigma.validate().is_err(), "Zero sigma is rejected");
        let bad_planes = RenderConfig {
            distortion_near: 5.0,
            distortion_far: 1.0,
            ..Default::default()
        };
        assert!(bad_planes.validate().is_err(), "near > far is rejected");
        let no_distortion = RenderConfig {
            distortion: DistortionKind::None,
            ..bad_planes
        };
        assert!(
            no_distortion.validate().is_ok(),
            "Planes don't matter without distortion"
        );
    }

    #[test]
    fn fingerprint_ignores_debug() {
        let config = RenderConfig::default();
        let debug = RenderConfig {
            debug: true,
            ..Default::default()
        };
        assert_eq!(config.fingerprint(), debug.fingerprint());
        let sharper = RenderConfig {
            sigma: 2.0,
            ..Default::default()
        };
        assert_ne!(config.fingerprint(), sharper.fingerprint());
        let prefiltered = RenderConfig {
            prefiltered: true,
            ..Default::default()
        };
        assert_ne!(config.fingerprint(), prefiltered.fingerprint());
    }

    #[test]
    fn serde_kebab_case() {
        let json = serde_json::to_string(&RenderConfig::default()).expect("Serializable");
        assert!(json.contains("\"scale-modifier\":1.0"), "{json}");
        assert!(json.contains("\"normalized-depth\""), "{json}");
        let back: RenderConfig = serde_json::from_str(&json).expect("Deserializable");
        assert_eq!(back, RenderConfig::default());
    }
}
