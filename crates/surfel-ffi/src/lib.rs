//! C ABI for the surfel rasterizer.
//!
//! Every entry point takes flat, caller owned `f32` buffers, returns a [`SurfelStatus`] and never
//! unwinds across the boundary. Scratch memory for a forward render is requested from the caller
//! through one [`SurfelAllocator`] per arena. The caller keeps those buffers unchanged and hands
//! them back to [`surfel_backward`].

use std::ffi::c_void;
use std::panic::{AssertUnwindSafe, catch_unwind};

use glam::{Mat3, Mat4, UVec2, Vec2, Vec3};
use surfel_kernel::{ArenaError, ScratchArena};
use surfel_render::render::SplatStatsTargets;
use surfel_render::{
    Camera, DistortionKind, FlatColors, RenderArenas, RenderConfig, RenderError, RenderSession,
    RenderTargets, SplatInputs, mark_visible, render_forward,
};
use surfel_render_bwd::{PixelGrads, SplatGradTargets, render_backward};

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SurfelStatus {
    Success = 0,
    /// A required pointer was null.
    NullPointer = 1,
    /// Mismatched sizes, misaligned buffers, bad options or an unsupported SH degree.
    InvalidInput = 2,
    /// An allocator callback was missing, returned null or returned a misaligned buffer.
    AllocationFailed = 3,
    /// The backward inputs don't match the forward render the arenas came from.
    SessionMismatch = 4,
    /// Internal error. Outputs are unspecified.
    Panic = 5,
}

impl From<&RenderError> for SurfelStatus {
    fn from(err: &RenderError) -> Self {
        match err {
            RenderError::Arena(ArenaError::Null(_) | ArenaError::Misaligned(_)) => {
                Self::AllocationFailed
            }
            RenderError::Arena(_) | RenderError::SessionMismatch(_) => Self::SessionMismatch,
            _ => Self::InvalidInput,
        }
    }
}

fn report(err: &RenderError) -> SurfelStatus {
    log::error!("{err}");
    err.into()
}

fn guarded(call: impl FnOnce() -> Result<(), SurfelStatus>) -> SurfelStatus {
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(())) => SurfelStatus::Success,
        Ok(Err(status)) => status,
        Err(_) => {
            log::error!("Panic inside a surfel call");
            SurfelStatus::Panic
        }
    }
}

fn check_ptr<T>(name: &str, ptr: *const T) -> Result<(), SurfelStatus> {
    if ptr.is_null() {
        log::error!("`{name}` is null");
        return Err(SurfelStatus::NullPointer);
    }
    if !ptr.is_aligned() {
        log::error!("`{name}` is misaligned");
        return Err(SurfelStatus::InvalidInput);
    }
    Ok(())
}

/// # Safety
///
/// If `ptr` is non-null it must be valid for reads of a `T` for `'a`.
unsafe fn deref<'a, T>(name: &str, ptr: *const T) -> Result<&'a T, SurfelStatus> {
    check_ptr(name, ptr)?;
    // SAFETY: Non-null and aligned, validity for reads is the caller's guarantee.
    Ok(unsafe { &*ptr })
}

/// # Safety
///
/// If `len > 0` and `ptr` is non-null, it must be valid for reads of `len` values of `T` for `'a`.
unsafe fn read_slice<'a, T>(
    name: &str,
    ptr: *const T,
    len: usize,
) -> Result<&'a [T], SurfelStatus> {
    if len == 0 {
        return Ok(&[]);
    }
    check_ptr(name, ptr)?;
    // SAFETY: Non-null and aligned, `len` readable values is the caller's guarantee.
    Ok(unsafe { std::slice::from_raw_parts(ptr, len) })
}

/// # Safety
///
/// If `len > 0` and `ptr` is non-null, it must be valid for reads and writes of `len` values of
/// `T` for `'a`, and not accessed through any other pointer meanwhile.
unsafe fn write_slice<'a, T>(
    name: &str,
    ptr: *mut T,
    len: usize,
) -> Result<&'a mut [T], SurfelStatus> {
    if len == 0 {
        return Ok(&mut []);
    }
    check_ptr(name, ptr.cast_const())?;
    // SAFETY: Non-null and aligned, exclusive access to `len` values is the caller's guarantee.
    Ok(unsafe { std::slice::from_raw_parts_mut(ptr, len) })
}

/// Like [`write_slice`], but a null pointer means the output isn't wanted.
///
/// # Safety
///
/// Same as [`write_slice`].
unsafe fn optional_slice<'a, T>(
    name: &str,
    ptr: *mut T,
    len: usize,
) -> Result<Option<&'a mut [T]>, SurfelStatus> {
    if ptr.is_null() {
        return Ok(None);
    }
    // SAFETY: Forwarded from the caller.
    unsafe { write_slice(name, ptr, len) }.map(Some)
}

/// A pinhole camera. View space looks down +z with +y pointing down the image.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SurfelCamera {
    /// Column-major world to view matrix.
    pub view: [f32; 16],
    /// Column-major view to clip matrix, used for the frustum test.
    pub proj: [f32; 16],
    /// Camera center in world space, the origin of SH view directions.
    pub position: [f32; 3],
    /// Focal lengths in pixels.
    pub focal: [f32; 2],
    /// Principal point in pixels.
    pub center: [f32; 2],
    pub width: u32,
    pub height: u32,
    pub background: [f32; 3],
}

impl From<&Camera> for SurfelCamera {
    fn from(camera: &Camera) -> Self {
        Self {
            view: camera.view.to_cols_array(),
            proj: camera.proj.to_cols_array(),
            position: camera.position.to_array(),
            focal: camera.focal.to_array(),
            center: camera.center.to_array(),
            width: camera.img_size.x,
            height: camera.img_size.y,
            background: camera.background.to_array(),
        }
    }
}

impl SurfelCamera {
    fn camera(&self) -> Camera {
        Camera::from_matrices(
            Mat4::from_cols_array(&self.view),
            Mat4::from_cols_array(&self.proj),
            Vec3::from(self.position),
            Vec2::from(self.focal),
            Vec2::from(self.center),
            UVec2::new(self.width, self.height),
        )
        .with_background(Vec3::from(self.background))
    }
}

/// Splat parameters, interleaved per splat.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct SurfelSplats {
    pub num_splats: u32,
    /// `3·P` floats.
    pub means: *const f32,
    /// `3·P` floats.
    pub scales: *const f32,
    /// `4·P` floats, `[w, x, y, z]` quaternions.
    pub rotations: *const f32,
    /// `P` activated opacities.
    pub opacities: *const f32,
    pub sh_degree: u32,
    pub sh_coeffs_per_splat: u32,
    /// `3·M·P` floats, or null to use `colors_precomp`.
    pub sh_coeffs: *const f32,
    /// `3·P` floats, read only when `sh_coeffs` is null.
    pub colors_precomp: *const f32,
}

impl SurfelSplats {
    fn colors_per_splat(&self) -> usize {
        if self.sh_coeffs.is_null() {
            1
        } else {
            self.sh_coeffs_per_splat as usize
        }
    }

    /// # Safety
    ///
    /// Every pointer that is read must be valid for reads of its documented size for `'a`.
    unsafe fn inputs<'a>(&self) -> Result<SplatInputs<'a>, SurfelStatus> {
        let n = self.num_splats as usize;
        // SAFETY: Forwarded from the caller.
        let (means, scales, rotations, opacities) = unsafe {
            (
                read_slice("means", self.means, 3 * n)?,
                read_slice("scales", self.scales, 3 * n)?,
                read_slice("rotations", self.rotations, 4 * n)?,
                read_slice("opacities", self.opacities, n)?,
            )
        };
        let colors = if self.sh_coeffs.is_null() {
            // SAFETY: Forwarded from the caller.
            let colors = unsafe { read_slice("colors_precomp", self.colors_precomp, 3 * n)? };
            FlatColors::Precomputed(colors)
        } else {
            let len = 3 * n * self.sh_coeffs_per_splat as usize;
            FlatColors::Sh {
                degree: self.sh_degree,
                coeffs_per_splat: self.sh_coeffs_per_splat,
                // SAFETY: Forwarded from the caller.
                coeffs: unsafe { read_slice("sh_coeffs", self.sh_coeffs, len)? },
            }
        };
        SplatInputs::from_flat(means, scales, rotations, opacities, colors)
            .map_err(|err| report(&err))
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SurfelRenderOptions {
    pub scale_modifier: f32,
    pub sigma: f32,
    /// Skip the frustum check, the caller already culled.
    pub prefiltered: bool,
    /// Distortion planes. A far plane `<= 0` disables the distortion term.
    pub distortion_near: f32,
    pub distortion_far: f32,
    /// Validate intermediate buffers and log violations.
    pub debug: bool,
}

impl From<SurfelRenderOptions> for RenderConfig {
    fn from(options: SurfelRenderOptions) -> Self {
        let distortion = if options.distortion_far > 0.0 {
            DistortionKind::NormalizedDepth
        } else {
            DistortionKind::None
        };
        Self {
            scale_modifier: options.scale_modifier,
            sigma: options.sigma,
            prefiltered: options.prefiltered,
            distortion,
            distortion_near: options.distortion_near,
            distortion_far: options.distortion_far,
            debug: options.debug,
        }
    }
}

/// Options matching the library defaults.
#[unsafe(no_mangle)]
pub extern "C" fn surfel_default_options() -> SurfelRenderOptions {
    let config = RenderConfig::default();
    SurfelRenderOptions {
        scale_modifier: config.scale_modifier,
        sigma: config.sigma,
        prefiltered: config.prefiltered,
        distortion_near: config.distortion_near,
        distortion_far: config.distortion_far,
        debug: config.debug,
    }
}

/// Returns a buffer of at least `bytes` bytes, 8-byte aligned, or null on failure. The buffer
/// must stay valid and untouched by the caller until the render (and any backward pass using
/// it) is done.
pub type SurfelAllocFn = extern "C" fn(user_data: *mut c_void, bytes: usize) -> *mut u8;

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct SurfelAllocator {
    pub alloc: Option<SurfelAllocFn>,
    /// Passed to `alloc` as is.
    pub user_data: *mut c_void,
}

/// Scratch arena backed by a caller allocator.
struct CallbackArena {
    allocator: SurfelAllocator,
}

impl ScratchArena for CallbackArena {
    fn obtain(&mut self, bytes: usize) -> Result<&mut [u64], ArenaError> {
        if bytes == 0 {
            return Ok(&mut []);
        }
        let Some(alloc) = self.allocator.alloc else {
            return Err(ArenaError::Null(bytes));
        };
        let ptr = alloc(self.allocator.user_data, bytes);
        if ptr.is_null() {
            return Err(ArenaError::Null(bytes));
        }
        let words = ptr.cast::<u64>();
        if !words.is_aligned() {
            return Err(ArenaError::Misaligned(ptr.addr()));
        }
        // SAFETY: The allocator contract: a non-null result is valid for reads and writes of
        // `bytes` bytes and nothing else accesses it during the call. Alignment is checked above.
        Ok(unsafe { std::slice::from_raw_parts_mut(words, bytes / 8) })
    }
}

/// Output buffers of [`surfel_forward`]. Images are planar, `[C][H][W]`.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct SurfelForwardOutputs {
    /// `3·H·W` floats.
    pub color: *mut f32,
    pub depth: *mut f32,
    /// `3·H·W` floats.
    pub normal: *mut f32,
    pub opacity: *mut f32,
    pub distortion: *mut f32,
    /// Optional, `P` screen space radii.
    pub radii: *mut u32,
    /// Optional per splat statistics, `P` values each. Pass all three or none.
    pub weight_sum: *mut f32,
    pub max_weight: *mut f32,
    pub pixel_count: *mut u32,
}

impl SurfelForwardOutputs {
    /// # Safety
    ///
    /// Every non-null pointer must be valid for writes of its documented size for `'a`.
    unsafe fn targets<'a>(
        &self,
        num_pixels: usize,
        num_splats: usize,
    ) -> Result<RenderTargets<'a>, SurfelStatus> {
        // SAFETY: Forwarded from the caller.
        unsafe {
            let stats = match (
                optional_slice("weight_sum", self.weight_sum, num_splats)?,
                optional_slice("max_weight", self.max_weight, num_splats)?,
                optional_slice("pixel_count", self.pixel_count, num_splats)?,
            ) {
                (Some(weight_sum), Some(max_weight), Some(pixel_count)) => {
                    Some(SplatStatsTargets {
                        weight_sum,
                        max_weight,
                        pixel_count,
                    })
                }
                (None, None, None) => None,
                _ => {
                    log::error!("Splat statistics need all three buffers");
                    return Err(SurfelStatus::InvalidInput);
                }
            };
            Ok(RenderTargets {
                color: write_slice("out_color", self.color, 3 * num_pixels)?,
                depth: write_slice("out_depth", self.depth, num_pixels)?,
                normal: write_slice("out_normal", self.normal, 3 * num_pixels)?,
                opacity: write_slice("out_opacity", self.opacity, num_pixels)?,
                distortion: write_slice("out_distortion", self.distortion, num_pixels)?,
                radii: optional_slice("radii", self.radii, num_splats)?,
                stats,
            })
        }
    }
}

/// Render splats into the output images.
///
/// On success `num_rendered` (if non-null) receives the number of splats that survived
/// projection, which [`surfel_backward`] needs.
///
/// # Safety
///
/// - `splats`, `camera`, `options` and `outputs` must point to valid structs, and every buffer
///   they reference must be valid for its documented size.
/// - Output buffers must not overlap each other or any input.
/// - Each allocator must follow the [`SurfelAllocFn`] contract.
/// - `num_rendered` must be null or valid for a write.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn surfel_forward(
    splats: *const SurfelSplats,
    camera: *const SurfelCamera,
    options: *const SurfelRenderOptions,
    geometry: SurfelAllocator,
    binning: SurfelAllocator,
    image: SurfelAllocator,
    outputs: *const SurfelForwardOutputs,
    num_rendered: *mut u32,
) -> SurfelStatus {
    guarded(|| {
        // SAFETY: The caller guarantees the structs are valid when non-null.
        let (splats, camera, options, outputs) = unsafe {
            (
                deref("splats", splats)?,
                deref("camera", camera)?,
                deref("options", options)?,
                deref("outputs", outputs)?,
            )
        };
        // SAFETY: The caller guarantees the splat buffers are valid.
        let inputs = unsafe { splats.inputs()? };
        let camera = camera.camera();
        let config = RenderConfig::from(*options);
        // SAFETY: The caller guarantees the output buffers are valid and exclusive.
        let targets = unsafe { outputs.targets(camera.num_pixels(), inputs.len())? };

        let mut geometry = CallbackArena {
            allocator: geometry,
        };
        let mut binning = CallbackArena { allocator: binning };
        let mut image = CallbackArena { allocator: image };
        let session = render_forward(
            &inputs,
            &camera,
            &config,
            RenderArenas {
                geometry: &mut geometry,
                binning: &mut binning,
                image: &mut image,
            },
            targets,
        )
        .map_err(|err| report(&err))?;

        if !num_rendered.is_null() {
            check_ptr("num_rendered", num_rendered.cast_const())?;
            // SAFETY: Non-null and aligned, the caller guarantees it is valid for a write.
            unsafe { num_rendered.write(session.num_visible()) };
        }
        Ok(())
    })
}

/// A scratch buffer a forward render filled in.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct SurfelArenaView {
    pub data: *const u8,
    pub bytes: usize,
}

impl SurfelArenaView {
    /// # Safety
    ///
    /// `data` must be valid for reads of `bytes` bytes for `'a`.
    unsafe fn words<'a>(&self, name: &str) -> Result<&'a [u64], SurfelStatus> {
        // SAFETY: Forwarded from the caller, whole words only.
        unsafe { read_slice(name, self.data.cast::<u64>(), self.bytes / 8) }
    }
}

/// Loss gradients with respect to each output image of [`surfel_forward`], same layout.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct SurfelPixelGrads {
    pub color: *const f32,
    pub depth: *const f32,
    pub normal: *const f32,
    pub opacity: *const f32,
    pub distortion: *const f32,
}

/// Gradient outputs of [`surfel_backward`]. Every value is overwritten.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct SurfelSplatGrads {
    /// `3·P` floats.
    pub means: *mut f32,
    /// `3·P` floats.
    pub scales: *mut f32,
    /// `4·P` floats.
    pub rotations: *mut f32,
    /// `P` floats.
    pub opacities: *mut f32,
    /// `3·M·P` floats for SH colors, `3·P` for precomputed colors.
    pub colors: *mut f32,
    /// `2·P` floats.
    pub means2d: *mut f32,
    /// `9·P` floats, column-major homography gradients.
    pub kwh: *mut f32,
    /// `2·P` floats.
    pub means2d_abs: *mut f32,
}

impl SurfelSplatGrads {
    /// # Safety
    ///
    /// Every pointer must be valid for writes of its documented size for `'a`.
    unsafe fn targets<'a>(
        &self,
        num_splats: usize,
        colors_per_splat: usize,
    ) -> Result<SplatGradTargets<'a>, SurfelStatus> {
        let n = num_splats;
        // SAFETY: Forwarded from the caller.
        unsafe {
            Ok(SplatGradTargets {
                v_means: bytemuck::cast_slice_mut(write_slice("dl_dmeans", self.means, 3 * n)?),
                v_scales: bytemuck::cast_slice_mut(write_slice("dl_dscales", self.scales, 3 * n)?),
                v_quats: bytemuck::cast_slice_mut(write_slice(
                    "dl_drotations",
                    self.rotations,
                    4 * n,
                )?),
                v_opacities: write_slice("dl_dopacity", self.opacities, n)?,
                v_colors: bytemuck::cast_slice_mut(write_slice(
                    "dl_dcolors",
                    self.colors,
                    3 * colors_per_splat * n,
                )?),
                v_means2d: bytemuck::cast_slice_mut::<f32, Vec2>(write_slice(
                    "dl_dmean2d",
                    self.means2d,
                    2 * n,
                )?),
                v_kwh: bytemuck::cast_slice_mut::<f32, Mat3>(write_slice(
                    "dl_dkwh",
                    self.kwh,
                    9 * n,
                )?),
                v_means2d_abs: bytemuck::cast_slice_mut::<f32, Vec2>(write_slice(
                    "dl_dmean2d_abs",
                    self.means2d_abs,
                    2 * n,
                )?),
            })
        }
    }
}

/// Backpropagate pixel gradients of a [`surfel_forward`] call to every splat parameter.
///
/// `splats`, `camera` and `options` must match the forward call, `num_rendered` is the count it
/// returned and the three arenas are the buffers its allocators handed out, unchanged.
///
/// # Safety
///
/// - Every struct pointer must be valid, and every buffer they reference must be valid for its
///   documented size.
/// - Each arena view must be valid for reads of `bytes` bytes.
/// - Gradient output buffers must not overlap each other or any input.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn surfel_backward(
    splats: *const SurfelSplats,
    camera: *const SurfelCamera,
    options: *const SurfelRenderOptions,
    num_rendered: u32,
    geometry: SurfelArenaView,
    binning: SurfelArenaView,
    image: SurfelArenaView,
    pixel_grads: *const SurfelPixelGrads,
    grads: *const SurfelSplatGrads,
) -> SurfelStatus {
    guarded(|| {
        // SAFETY: The caller guarantees the structs are valid when non-null.
        let (splats, camera, options, pixel_grads, grads) = unsafe {
            (
                deref("splats", splats)?,
                deref("camera", camera)?,
                deref("options", options)?,
                deref("pixel_grads", pixel_grads)?,
                deref("grads", grads)?,
            )
        };
        // SAFETY: The caller guarantees the splat buffers are valid.
        let inputs = unsafe { splats.inputs()? };
        let camera = camera.camera();
        let config = RenderConfig::from(*options);
        let num_pixels = camera.num_pixels();

        // SAFETY: The caller guarantees the arenas are valid for reads.
        let (geometry, binning, image) = unsafe {
            (
                geometry.words("geometry")?,
                binning.words("binning")?,
                image.words("image")?,
            )
        };
        let session = RenderSession::restore(
            &inputs,
            &camera,
            &config,
            num_rendered,
            geometry,
            binning,
            image,
        )
        .map_err(|err| report(&err))?;

        // SAFETY: The caller guarantees the gradient buffers are valid.
        let pixel_grads = unsafe {
            PixelGrads {
                v_color: read_slice("dl_dcolor", pixel_grads.color, 3 * num_pixels)?,
                v_depth: read_slice("dl_ddepth", pixel_grads.depth, num_pixels)?,
                v_normal: read_slice("dl_dnormal", pixel_grads.normal, 3 * num_pixels)?,
                v_opacity: read_slice("dl_dopacity", pixel_grads.opacity, num_pixels)?,
                v_distortion: read_slice("dl_ddistortion", pixel_grads.distortion, num_pixels)?,
            }
        };
        // SAFETY: The caller guarantees the output buffers are valid and exclusive.
        let targets = unsafe { grads.targets(inputs.len(), splats.colors_per_splat())? };

        render_backward(&inputs, &camera, &session, &pixel_grads, targets)
            .map_err(|err| report(&err))
    })
}

/// Mark which splat centers are in the camera's view.
///
/// # Safety
///
/// `means` must be valid for reads of `3·num_splats` floats, `camera` must point to a valid
/// camera and `present` must be valid for writes of `num_splats` initialized bools.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn surfel_mark_visible(
    num_splats: u32,
    means: *const f32,
    camera: *const SurfelCamera,
    present: *mut bool,
) -> SurfelStatus {
    guarded(|| {
        let n = num_splats as usize;
        // SAFETY: Forwarded from the caller.
        let (means, camera, present) = unsafe {
            (
                read_slice("means", means, 3 * n)?,
                deref("camera", camera)?,
                write_slice("present", present, n)?,
            )
        };
        let means: &[Vec3] = bytemuck::cast_slice(means);
        mark_visible(means, &camera.camera(), present).map_err(|err| report(&err))
    })
}
