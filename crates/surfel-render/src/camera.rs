use glam::{Mat3, Mat4, UVec2, Vec2, Vec3, Vec4};

use crate::TILE_WIDTH;

/// Near and far planes baked into the clip-space projection built from intrinsics.
const CLIP_NEAR: f32 = 0.01;
const CLIP_FAR: f32 = 1000.0;

/// A pinhole camera. View space looks down +z with +y pointing down the image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    /// World to view transform.
    pub view: Mat4,
    /// View to clip transform.
    pub proj: Mat4,
    /// World to clip transform (projection * view).
    pub full_proj: Mat4,
    /// Camera center in world space.
    pub position: Vec3,
    /// Focal lengths in pixels.
    pub focal: Vec2,
    /// Principal point in pixels.
    pub center: Vec2,
    pub img_size: UVec2,
    pub background: Vec3,
}

fn projection_from_intrinsics(focal: Vec2, center: Vec2, img_size: UVec2) -> Mat4 {
    let size = img_size.as_vec2();
    let (n, f) = (CLIP_NEAR, CLIP_FAR);
    Mat4::from_cols(
        Vec4::new(2.0 * focal.x / size.x, 0.0, 0.0, 0.0),
        Vec4::new(0.0, 2.0 * focal.y / size.y, 0.0, 0.0),
        Vec4::new(
            2.0 * center.x / size.x - 1.0,
            2.0 * center.y / size.y - 1.0,
            f / (f - n),
            1.0,
        ),
        Vec4::new(0.0, 0.0, -f * n / (f - n), 0.0),
    )
}

impl Camera {
    /// Build a camera from a world to view matrix and pixel intrinsics. The projection is derived
    /// from the intrinsics and the position from the inverse view.
    pub fn new(view: Mat4, focal: Vec2, center: Vec2, img_size: UVec2) -> Self {
        Self::from_matrices(
            view,
            projection_from_intrinsics(focal, center, img_size),
            view.inverse().w_axis.truncate(),
            focal,
            center,
            img_size,
        )
    }

    /// Build a camera from caller supplied view and projection matrices and camera position.
    ///
    /// The projection only drives the frustum test; pixels are always placed with `focal` and
    /// `center`. `position` is the origin of the SH view directions.
    pub fn from_matrices(
        view: Mat4,
        proj: Mat4,
        position: Vec3,
        focal: Vec2,
        center: Vec2,
        img_size: UVec2,
    ) -> Self {
        Self {
            view,
            proj,
            full_proj: proj * view,
            position,
            focal,
            center,
            img_size,
            background: Vec3::ZERO,
        }
    }

    /// A camera at `eye` looking at `target`, with a vertical field of view in radians and the
    /// principal point in the image center.
    pub fn look_at(eye: Vec3, target: Vec3, up: Vec3, fov_y: f32, img_size: UVec2) -> Self {
        let forward = (target - eye).normalize();
        let right = forward.cross(up).normalize();
        let down = forward.cross(right);
        let rot = Mat3::from_cols(right, down, forward).transpose();
        let trans = -(rot * eye);
        let view = Mat4::from_cols(
            rot.x_axis.extend(0.0),
            rot.y_axis.extend(0.0),
            rot.z_axis.extend(0.0),
            trans.extend(1.0),
        );
        let size = img_size.as_vec2();
        let focal_y = 0.5 * size.y / (0.5 * fov_y).tan();
        Self::new(view, Vec2::splat(focal_y), 0.5 * size, img_size)
    }

    #[must_use]
    pub fn with_background(mut self, background: Vec3) -> Self {
        self.background = background;
        self
    }

    /// Upper 3x3 of the view matrix.
    pub fn rotation(&self) -> Mat3 {
        Mat3::from_mat4(self.view)
    }

    pub fn world_to_view(&self, point: Vec3) -> Vec3 {
        self.view.transform_point3(point)
    }

    /// Pixel intrinsics matrix K.
    pub fn intrinsics(&self) -> Mat3 {
        Mat3::from_cols(
            Vec3::new(self.focal.x, 0.0, 0.0),
            Vec3::new(0.0, self.focal.y, 0.0),
            Vec3::new(self.center.x, self.center.y, 1.0),
        )
    }

    /// Project a view space point to pixel coordinates.
    pub fn view_to_pixel(&self, point: Vec3) -> Vec2 {
        point.truncate() / point.z * self.focal + self.center
    }

    pub fn tile_bounds(&self) -> UVec2 {
        calc_tile_bounds(self.img_size)
    }

    pub fn num_pixels(&self) -> usize {
        self.img_size.x as usize * self.img_size.y as usize
    }

    /// Bit pattern summary used to check that a backward pass sees the camera its forward
    /// pass was rendered with.
    pub fn fingerprint(&self) -> u64 {
        let floats = self
            .view
            .to_cols_array()
            .into_iter()
            .chain(self.proj.to_cols_array())
            .chain(self.position.to_array())
            .chain(self.focal.to_array())
            .chain(self.center.to_array())
            .chain(self.background.to_array());
        fnv1a(
            floats
                .map(f32::to_bits)
                .chain([self.img_size.x, self.img_size.y]),
        )
    }
}

/// 64-bit FNV-1a over 32-bit words.
pub(crate) fn fnv1a(words: impl IntoIterator<Item = u32>) -> u64 {
    words.into_iter().fold(0xcbf2_9ce4_8422_2325u64, |hash, word| {
        (hash ^ u64::from(word)).wrapping_mul(0x0100_0000_01b3)
    })
}

pub fn calc_tile_bounds(img_size: UVec2) -> UVec2 {
    UVec2::new(
        img_size.x.div_ceil(TILE_WIDTH),
        img_size.y.div_ceil(TILE_WIDTH),
    )
}
