//! Shared infrastructure for the surfel rasterizer stages.
//!
//! - [`ScratchArena`]: caller-owned, growable scratch storage. Every stage carves typed views out
//!   of word aligned arenas with [`ArenaCarver`] / [`ArenaReader`] instead of reinterpreting raw
//!   pointers.
//! - [`AtomicF32`]: lock-free float accumulation for values many workers write into.
//! - [`DisjointSlice`]: scatter target for workers writing distinct indices.
//! - Work group sizing helpers used by the data-parallel passes.
//!
//! # Example
//!
//! ```
//! use surfel_kernel::{ArenaCarver, ArenaLayout, ScratchArena};
//!
//! let layout = ArenaLayout::new().with::<u32>(10).with::<f32>(3);
//! let mut arena: Vec<u64> = Vec::new();
//! let words = arena.obtain(layout.bytes()).unwrap();
//! let mut carver = ArenaCarver::new(words);
//! let counts = carver.take::<u32>(10).unwrap();
//! let depths = carver.take::<f32>(3).unwrap();
//! assert_eq!((counts.len(), depths.len()), (10, 3));
//! ```
mod arena;
mod atomic;
mod disjoint;

pub use arena::{ArenaCarver, ArenaError, ArenaLayout, ArenaReader, ScratchArena, words_for};
pub use atomic::{AtomicF32, accumulators, read_accumulators};
pub use disjoint::DisjointSlice;

// Re-export bytemuck for the typed views.
pub use bytemuck;

/// Number of elements a single worker handles in the scan and sort passes.
pub const GROUP_SIZE: usize = 4096;

/// Number of work groups needed to cover `num_elements`, at least one.
pub fn calc_group_count(num_elements: usize, group_size: usize) -> usize {
    num_elements.div_ceil(group_size).max(1)
}

/// Size of each of `num_groups` near-equal chunks covering `num_elements`.
pub fn calc_chunk_len(num_elements: usize, num_groups: usize) -> usize {
    num_elements.div_ceil(num_groups.max(1)).max(1)
}

#[cfg(test)]
mod tests {
    use super::{calc_chunk_len, calc_group_count};

    #[test]
    fn group_counts() {
        assert_eq!(calc_group_count(0, 512), 1);
        assert_eq!(calc_group_count(512, 512), 1);
        assert_eq!(calc_group_count(513, 512), 2);
        assert_eq!(calc_chunk_len(10, 3), 4);
        assert_eq!(calc_chunk_len(0, 3), 1);
    }
}
