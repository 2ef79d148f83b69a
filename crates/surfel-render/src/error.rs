use surfel_kernel::ArenaError;

/// Contract violations of a render or backward call.
///
/// Degenerate splats and numerical edge cases never show up here, they are culled or clamped.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("Can't render images with 0 size ({width}x{height})")]
    EmptyImage { width: u32, height: u32 },
    #[error("Buffer `{name}` has {got} elements, expected {expected}")]
    BufferSize {
        name: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("Unsupported SH: degree {degree} with {coeffs} coefficients per splat")]
    ShDegree { degree: u32, coeffs: u32 },
    #[error("Invalid render config: {0}")]
    Config(String),
    #[error("Render produced {0} tile intersections, more than can be indexed")]
    TooManyIntersections(u64),
    #[error("Render session mismatch: {0}")]
    SessionMismatch(String),
    #[error(transparent)]
    Arena(#[from] ArenaError),
}

/// Check a caller buffer holds exactly `expected` elements.
pub fn check_len<T>(name: &'static str, buf: &[T], expected: usize) -> Result<(), RenderError> {
    if buf.len() == expected {
        Ok(())
    } else {
        Err(RenderError::BufferSize {
            name,
            expected,
            got: buf.len(),
        })
    }
}
