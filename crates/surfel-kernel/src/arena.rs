use bytemuck::Pod;

#[derive(Debug, thiserror::Error)]
pub enum ArenaError {
    #[error("Scratch allocator returned a null pointer for {0} bytes")]
    Null(usize),
    #[error("Scratch arena pointer {0:#x} is not 8-byte aligned")]
    Misaligned(usize),
    #[error("View of {len} x {ty} needs {needed} bytes, only {remaining} left in the arena")]
    Overrun {
        ty: &'static str,
        len: usize,
        needed: usize,
        remaining: usize,
    },
    #[error("Typed view cast failed: {0:?}")]
    Cast(bytemuck::PodCastError),
}

/// Growable scratch storage owned by the caller of a render.
///
/// A render asks each arena once for the number of bytes it needs and then carves its
/// intermediate buffers out of the returned words. The arena is free to hand back more than
/// requested. Contents are unspecified, every stage writes before it reads.
pub trait ScratchArena {
    fn obtain(&mut self, bytes: usize) -> Result<&mut [u64], ArenaError>;
}

impl ScratchArena for Vec<u64> {
    fn obtain(&mut self, bytes: usize) -> Result<&mut [u64], ArenaError> {
        let words = bytes.div_ceil(8);
        if self.len() < words {
            log::debug!("Growing scratch arena to {bytes} bytes");
            self.resize(words, 0);
        }
        Ok(&mut self[..words])
    }
}

/// Number of 8-byte words needed to hold `len` values of `T`.
pub const fn words_for<T>(len: usize) -> usize {
    (len * size_of::<T>()).div_ceil(8)
}

/// Accumulates the size of a sequence of typed views, in the same order they are later
/// carved with [`ArenaCarver::take`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ArenaLayout {
    words: usize,
}

impl ArenaLayout {
    pub const fn new() -> Self {
        Self { words: 0 }
    }

    #[must_use]
    pub const fn with<T>(self, len: usize) -> Self {
        Self {
            words: self.words + words_for::<T>(len),
        }
    }

    pub const fn words(self) -> usize {
        self.words
    }

    pub const fn bytes(self) -> usize {
        self.words * 8
    }
}

fn check_view<T>(len: usize, remaining_words: usize) -> Result<usize, ArenaError> {
    const {
        assert!(
            align_of::<T>() <= 8,
            "Arena views only support types with alignment <= 8"
        );
    };
    let words = words_for::<T>(len);
    if words > remaining_words {
        return Err(ArenaError::Overrun {
            ty: std::any::type_name::<T>(),
            len,
            needed: len * size_of::<T>(),
            remaining: remaining_words * 8,
        });
    }
    Ok(words)
}

/// Splits a mutable arena into consecutive, word aligned typed views.
pub struct ArenaCarver<'a> {
    rest: &'a mut [u64],
}

impl<'a> ArenaCarver<'a> {
    pub fn new(words: &'a mut [u64]) -> Self {
        Self { rest: words }
    }

    pub fn take<T: Pod>(&mut self, len: usize) -> Result<&'a mut [T], ArenaError> {
        let words = check_view::<T>(len, self.rest.len())?;
        let rest = std::mem::take(&mut self.rest);
        let (head, tail) = rest.split_at_mut(words);
        self.rest = tail;
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(head);
        bytemuck::try_cast_slice_mut(&mut bytes[..len * size_of::<T>()]).map_err(ArenaError::Cast)
    }

    /// Words not yet handed out.
    pub fn remaining(&self) -> usize {
        self.rest.len()
    }
}

/// Read-only counterpart of [`ArenaCarver`], used to view an arena written by a previous pass.
pub struct ArenaReader<'a> {
    rest: &'a [u64],
}

impl<'a> ArenaReader<'a> {
    pub fn new(words: &'a [u64]) -> Self {
        Self { rest: words }
    }

    pub fn take<T: Pod>(&mut self, len: usize) -> Result<&'a [T], ArenaError> {
        let words = check_view::<T>(len, self.rest.len())?;
        let (head, tail) = self.rest.split_at(words);
        self.rest = tail;
        let bytes: &[u8] = bytemuck::cast_slice(head);
        bytemuck::try_cast_slice(&bytes[..len * size_of::<T>()]).map_err(ArenaError::Cast)
    }
}

#[cfg(test)]
mod tests {
    use super::{ArenaCarver, ArenaError, ArenaLayout, ArenaReader, ScratchArena, words_for};

    #[test]
    fn layout_rounds_to_words() {
        assert_eq!(words_for::<u32>(3), 2);
        assert_eq!(words_for::<u64>(3), 3);
        let layout = ArenaLayout::new().with::<u32>(3).with::<[f32; 3]>(1);
        assert_eq!(layout.words(), 4);
        assert_eq!(layout.bytes(), 32);
    }

    #[test]
    fn carve_then_read_back() {
        let layout = ArenaLayout::new().with::<u32>(5).with::<f32>(2);
        let mut arena: Vec<u64> = Vec::new();
        {
            let words = arena.obtain(layout.bytes()).expect("Vec arena never fails");
            let mut carver = ArenaCarver::new(words);
            let a = carver.take::<u32>(5).expect("fits");
            a.copy_from_slice(&[1, 2, 3, 4, 5]);
            let b = carver.take::<f32>(2).expect("fits");
            b.copy_from_slice(&[0.5, -1.0]);
            assert_eq!(carver.remaining(), 0);
        }
        let mut reader = ArenaReader::new(&arena);
        assert_eq!(reader.take::<u32>(5).expect("fits"), &[1, 2, 3, 4, 5]);
        assert_eq!(reader.take::<f32>(2).expect("fits"), &[0.5, -1.0]);
    }

    #[test]
    fn overrun_is_an_error() {
        let mut words = vec![0u64; 2];
        let mut carver = ArenaCarver::new(&mut words);
        assert!(
            matches!(carver.take::<u32>(5), Err(ArenaError::Overrun { .. })),
            "20 bytes can't fit in 16"
        );
    }

    #[test]
    fn vec_arena_grows_but_never_shrinks() {
        let mut arena: Vec<u64> = Vec::new();
        assert_eq!(arena.obtain(20).expect("grow").len(), 3);
        assert_eq!(arena.obtain(8).expect("reuse").len(), 1);
        assert_eq!(arena.len(), 3);
    }
}
