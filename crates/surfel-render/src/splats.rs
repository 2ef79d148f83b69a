use glam::Vec3;

use crate::RenderError;
use crate::error::check_len;
use crate::sh::{MAX_SH_DEGREE, sh_coeffs_for_degree};

/// Per splat color source.
#[derive(Clone, Copy, Debug)]
pub enum SplatColors<'a> {
    /// Spherical harmonics coefficients, `coeffs_per_splat` RGB coefficients per splat of which
    /// the first `(degree + 1)²` are evaluated.
    Sh {
        degree: u32,
        coeffs_per_splat: u32,
        coeffs: &'a [Vec3],
    },
    /// One RGB color per splat, used as is.
    Precomputed(&'a [Vec3]),
}

/// The splats to render. Borrowed from the caller and never modified.
#[derive(Clone, Copy, Debug)]
pub struct SplatInputs<'a> {
    pub means: &'a [Vec3],
    /// Per axis scales. Only x and y span the splat plane.
    pub scales: &'a [Vec3],
    /// Rotations as `[w, x, y, z]` quaternions, normalized during projection.
    pub rotations: &'a [[f32; 4]],
    /// Activated opacities in `[0, 1]`.
    pub opacities: &'a [f32],
    pub colors: SplatColors<'a>,
}

fn cast_vec3<'a>(name: &'static str, flat: &'a [f32]) -> Result<&'a [Vec3], RenderError> {
    bytemuck::try_cast_slice(flat).map_err(|_err| RenderError::BufferSize {
        name,
        expected: flat.len().next_multiple_of(3),
        got: flat.len(),
    })
}

impl<'a> SplatInputs<'a> {
    /// View flat, interleaved `f32` buffers as splat inputs.
    pub fn from_flat(
        means: &'a [f32],
        scales: &'a [f32],
        rotations: &'a [f32],
        opacities: &'a [f32],
        colors: FlatColors<'a>,
    ) -> Result<Self, RenderError> {
        let rotations = bytemuck::try_cast_slice(rotations).map_err(|_err| {
            RenderError::BufferSize {
                name: "rotations",
                expected: rotations.len().next_multiple_of(4),
                got: rotations.len(),
            }
        })?;
        let colors = match colors {
            FlatColors::Sh {
                degree,
                coeffs_per_splat,
                coeffs,
            } => SplatColors::Sh {
                degree,
                coeffs_per_splat,
                coeffs: cast_vec3("sh_coeffs", coeffs)?,
            },
            FlatColors::Precomputed(colors) => {
                SplatColors::Precomputed(cast_vec3("colors_precomp", colors)?)
            }
        };
        let inputs = Self {
            means: cast_vec3("means", means)?,
            scales: cast_vec3("scales", scales)?,
            rotations,
            opacities,
            colors,
        };
        inputs.validate()?;
        Ok(inputs)
    }

    pub fn len(&self) -> usize {
        self.means.len()
    }

    pub fn is_empty(&self) -> bool {
        self.means.is_empty()
    }

    /// Active SH degree and coefficients stored per splat, `(0, 0)` for precomputed colors.
    pub fn sh_dims(&self) -> (u32, u32) {
        match self.colors {
            SplatColors::Sh {
                degree,
                coeffs_per_splat,
                ..
            } => (degree, coeffs_per_splat),
            SplatColors::Precomputed(_) => (0, 0),
        }
    }

    pub fn validate(&self) -> Result<(), RenderError> {
        let n = self.len();
        check_len("scales", self.scales, n)?;
        check_len("rotations", self.rotations, n)?;
        check_len("opacities", self.opacities, n)?;
        match self.colors {
            SplatColors::Sh {
                degree,
                coeffs_per_splat,
                coeffs,
            } => {
                if degree > MAX_SH_DEGREE || coeffs_per_splat < sh_coeffs_for_degree(degree) {
                    return Err(RenderError::ShDegree {
                        degree,
                        coeffs: coeffs_per_splat,
                    });
                }
                check_len("sh_coeffs", coeffs, n * coeffs_per_splat as usize)
            }
            SplatColors::Precomputed(colors) => check_len("colors_precomp", colors, n),
        }
    }
}

/// Flat counterpart of [`SplatColors`].
#[derive(Clone, Copy, Debug)]
pub enum FlatColors<'a> {
    Sh {
        degree: u32,
        coeffs_per_splat: u32,
        coeffs: &'a [f32],
    },
    Precomputed(&'a [f32]),
}
