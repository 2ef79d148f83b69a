use glam::Vec3;

pub const MAX_SH_DEGREE: u32 = 3;
pub const MAX_SH_COEFFS: usize = 16;

pub const SH_C0: f32 = 0.282_094_8;
pub const SH_C1: f32 = 0.488_602_5;
pub const SH_C2: [f32; 5] = [
    1.092_548_4,
    -1.092_548_4,
    0.315_391_57,
    -1.092_548_4,
    0.546_274_2,
];
pub const SH_C3: [f32; 7] = [
    -0.590_043_6,
    2.890_611_4,
    -0.457_045_8,
    0.373_176_34,
    -0.457_045_8,
    1.445_305_7,
    -0.590_043_6,
];

pub const fn sh_coeffs_for_degree(degree: u32) -> u32 {
    (degree + 1).pow(2)
}

pub fn sh_degree_from_coeffs(coeffs_per_channel: u32) -> Option<u32> {
    match coeffs_per_channel {
        1 => Some(0),
        4 => Some(1),
        9 => Some(2),
        16 => Some(3),
        _ => None,
    }
}

pub fn channel_to_sh(rgb: f32) -> f32 {
    (rgb - 0.5) / SH_C0
}

pub fn rgb_to_sh(rgb: Vec3) -> Vec3 {
    glam::vec3(
        channel_to_sh(rgb.x),
        channel_to_sh(rgb.y),
        channel_to_sh(rgb.z),
    )
}

/// Real SH basis up to `degree`, evaluated at a unit direction. Entries past the degree are 0.
pub fn sh_basis(degree: u32, dir: Vec3) -> [f32; MAX_SH_COEFFS] {
    let mut basis = [0.0; MAX_SH_COEFFS];
    basis[0] = SH_C0;
    if degree == 0 {
        return basis;
    }

    let Vec3 { x, y, z } = dir;
    basis[1] = -SH_C1 * y;
    basis[2] = SH_C1 * z;
    basis[3] = -SH_C1 * x;
    if degree == 1 {
        return basis;
    }

    let (xx, yy, zz) = (x * x, y * y, z * z);
    let (xy, yz, xz) = (x * y, y * z, x * z);
    basis[4] = SH_C2[0] * xy;
    basis[5] = SH_C2[1] * yz;
    basis[6] = SH_C2[2] * (2.0 * zz - xx - yy);
    basis[7] = SH_C2[3] * xz;
    basis[8] = SH_C2[4] * (xx - yy);
    if degree == 2 {
        return basis;
    }

    basis[9] = SH_C3[0] * y * (3.0 * xx - yy);
    basis[10] = SH_C3[1] * xy * z;
    basis[11] = SH_C3[2] * y * (4.0 * zz - xx - yy);
    basis[12] = SH_C3[3] * z * (2.0 * zz - 3.0 * xx - 3.0 * yy);
    basis[13] = SH_C3[4] * x * (4.0 * zz - xx - yy);
    basis[14] = SH_C3[5] * z * (xx - yy);
    basis[15] = SH_C3[6] * x * (xx - 3.0 * yy);
    basis
}

/// Gradient of every basis function of [`sh_basis`] with respect to the (unnormalized) direction
/// components, evaluated at `dir`.
pub fn sh_basis_grad(degree: u32, dir: Vec3) -> [Vec3; MAX_SH_COEFFS] {
    let mut grad = [Vec3::ZERO; MAX_SH_COEFFS];
    if degree == 0 {
        return grad;
    }

    let Vec3 { x, y, z } = dir;
    grad[1] = Vec3::new(0.0, -SH_C1, 0.0);
    grad[2] = Vec3::new(0.0, 0.0, SH_C1);
    grad[3] = Vec3::new(-SH_C1, 0.0, 0.0);
    if degree == 1 {
        return grad;
    }

    let (xx, yy, zz) = (x * x, y * y, z * z);
    let (xy, yz, xz) = (x * y, y * z, x * z);
    grad[4] = SH_C2[0] * Vec3::new(y, x, 0.0);
    grad[5] = SH_C2[1] * Vec3::new(0.0, z, y);
    grad[6] = SH_C2[2] * Vec3::new(-2.0 * x, -2.0 * y, 4.0 * z);
    grad[7] = SH_C2[3] * Vec3::new(z, 0.0, x);
    grad[8] = SH_C2[4] * Vec3::new(2.0 * x, -2.0 * y, 0.0);
    if degree == 2 {
        return grad;
    }

    grad[9] = SH_C3[0] * Vec3::new(6.0 * xy, 3.0 * xx - 3.0 * yy, 0.0);
    grad[10] = SH_C3[1] * Vec3::new(yz, xz, xy);
    grad[11] = SH_C3[2] * Vec3::new(-2.0 * xy, 4.0 * zz - xx - 3.0 * yy, 8.0 * yz);
    grad[12] = SH_C3[3] * Vec3::new(-6.0 * xz, -6.0 * yz, 6.0 * zz - 3.0 * xx - 3.0 * yy);
    grad[13] = SH_C3[4] * Vec3::new(4.0 * zz - 3.0 * xx - yy, -2.0 * xy, 8.0 * xz);
    grad[14] = SH_C3[5] * Vec3::new(2.0 * xz, -2.0 * yz, xx - yy);
    grad[15] = SH_C3[6] * Vec3::new(3.0 * xx - 3.0 * yy, -6.0 * xy, 0.0);
    grad
}

/// Bit `c` is set when color channel `c` evaluated negative and was clamped to zero.
pub type ClampMask = u32;

/// Evaluate a view dependent color from one splat's coefficients.
///
/// The result is offset by 0.5, so all-zero coefficients give mid gray, and negative channels are
/// clamped to zero and recorded in the returned mask.
pub fn sh_to_color(degree: u32, coeffs: &[Vec3], dir: Vec3) -> (Vec3, ClampMask) {
    let basis = sh_basis(degree, dir);
    let num = sh_coeffs_for_degree(degree) as usize;
    let raw = coeffs[..num]
        .iter()
        .zip(basis)
        .fold(Vec3::splat(0.5), |acc, (&c, b)| acc + c * b);

    let mut mask = 0;
    for c in 0..3 {
        if raw[c] < 0.0 {
            mask |= 1 << c;
        }
    }
    (raw.max(Vec3::ZERO), mask)
}
