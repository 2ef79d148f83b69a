use rayon::prelude::*;
use surfel_kernel::{DisjointSlice, GROUP_SIZE};

const BITS_PER_PASS: u32 = 8;
const BIN_COUNT: usize = 1 << BITS_PER_PASS;

/// Number of low bits needed to represent every key up to `max_key`.
pub fn bits_needed(max_key: u64) -> u32 {
    u64::BITS - max_key.leading_zeros()
}

#[inline]
fn digit(key: u64, shift: u32) -> usize {
    ((key >> shift) as usize) & (BIN_COUNT - 1)
}

// One stable counting pass over `shift..shift + 8`. Returns false when every key falls into the
// same bin, in which case nothing is written and `src` stays the live buffer.
fn sort_pass(
    src_keys: &[u64],
    src_values: &[u32],
    dst_keys: &mut [u64],
    dst_values: &mut [u32],
    shift: u32,
) -> bool {
    let histograms: Vec<[usize; BIN_COUNT]> = src_keys
        .par_chunks(GROUP_SIZE)
        .map(|chunk| {
            let mut hist = [0; BIN_COUNT];
            for &k in chunk {
                hist[digit(k, shift)] += 1;
            }
            hist
        })
        .collect();

    let n = src_keys.len();
    let single_bin =
        (0..BIN_COUNT).any(|bin| histograms.iter().map(|h| h[bin]).sum::<usize>() == n);
    if single_bin {
        return false;
    }

    let mut offsets = vec![[0usize; BIN_COUNT]; histograms.len()];
    let mut running = 0;
    for bin in 0..BIN_COUNT {
        for (group, hist) in histograms.iter().enumerate() {
            offsets[group][bin] = running;
            running += hist[bin];
        }
    }

    let out_keys = DisjointSlice::new(dst_keys);
    let out_values = DisjointSlice::new(dst_values);

    src_keys
        .par_chunks(GROUP_SIZE)
        .zip(src_values.par_chunks(GROUP_SIZE))
        .zip(offsets.into_par_iter())
        .for_each(|((keys, values), mut offsets)| {
            for (&k, &v) in keys.iter().zip(values) {
                let bin = digit(k, shift);
                let pos = offsets[bin];
                offsets[bin] += 1;
                // SAFETY: Each (group, bin) pair owns the output range starting at its offset and
                // spanning its histogram count. Ranges don't overlap across groups or bins.
                unsafe {
                    out_keys.write(pos, k);
                    out_values.write(pos, v);
                }
            }
        });

    true
}

/// Stable key/value sort on the low `sorting_bits` bits of `keys`.
///
/// This is a least significant digit radix sort. Each 8-bit pass builds per-group histograms in
/// parallel, turns them into scatter offsets and scatters every group in parallel. The scratch
/// buffers must be at least as long as the input; the result always ends up in `keys` and `values`.
pub fn radix_argsort(
    keys: &mut [u64],
    values: &mut [u32],
    scratch_keys: &mut [u64],
    scratch_values: &mut [u32],
    sorting_bits: u32,
) {
    let n = keys.len();
    assert_eq!(n, values.len(), "Keys and values must have the same length");
    assert!(
        scratch_keys.len() >= n && scratch_values.len() >= n,
        "Sort scratch buffers are too small ({} / {} for {n} entries)",
        scratch_keys.len(),
        scratch_values.len()
    );
    assert!(sorting_bits <= u64::BITS, "Can't sort more than 64 bits");

    let scratch_keys = &mut scratch_keys[..n];
    let scratch_values = &mut scratch_values[..n];

    if n <= 1 {
        return;
    }

    let mut in_scratch = false;
    for pass in 0..sorting_bits.div_ceil(BITS_PER_PASS) {
        let shift = pass * BITS_PER_PASS;
        let swapped = tracing::trace_span!("SortPass", shift).in_scope(|| {
            if in_scratch {
                sort_pass(scratch_keys, scratch_values, keys, values, shift)
            } else {
                sort_pass(keys, values, scratch_keys, scratch_values, shift)
            }
        });
        in_scratch ^= swapped;
    }

    if in_scratch {
        keys.copy_from_slice(scratch_keys);
        values.copy_from_slice(scratch_values);
    }
}

#[cfg(test)]
mod tests {
    use crate::{bits_needed, radix_argsort};
    use rand::{RngExt, SeedableRng};

    pub fn argsort<T: Ord>(data: &[T]) -> Vec<usize> {
        let mut indices = (0..data.len()).collect::<Vec<_>>();
        indices.sort_by_key(|&i| &data[i]);
        indices
    }

    fn check_sorted(keys_inp: &[u64], bits: u32) {
        let values_inp: Vec<u32> = (0..keys_inp.len() as u32).collect();
        let mut keys = keys_inp.to_vec();
        let mut values = values_inp.clone();
        let mut scratch_keys = vec![0; keys.len()];
        let mut scratch_values = vec![0; keys.len()];
        radix_argsort(
            &mut keys,
            &mut values,
            &mut scratch_keys,
            &mut scratch_values,
            bits,
        );

        let inds = argsort(keys_inp);
        let ref_keys: Vec<u64> = inds.iter().map(|&i| keys_inp[i]).collect();
        let ref_values: Vec<u32> = inds.iter().map(|&i| values_inp[i]).collect();
        assert_eq!(keys, ref_keys);
        // Stable sort: equal keys keep their input order.
        assert_eq!(values, ref_values);
    }

    #[test]
    fn test_sorting() {
        for i in 0..128u64 {
            let keys_inp = [
                5 + i * 4,
                i,
                6,
                123,
                74657,
                123,
                999,
                2u64.pow(24) + 123,
                6,
                7,
                8,
                0,
                i * 2,
                16 + i,
                128 * i,
            ];
            check_sorted(&keys_inp, 32);
        }
    }

    #[test]
    fn test_sorting_big() {
        // Simulate some data as one might find for a bunch of splats.
        let mut rng = rand::rngs::StdRng::seed_from_u64(0);
        let mut keys_inp = Vec::new();
        for i in 0..10000u64 {
            let start = rng.random_range(i..i + 150);
            let end = rng.random_range(start..start + 250);

            for j in start..end {
                if rng.random::<f32>() < 0.5 {
                    keys_inp.push(j);
                }
            }
        }
        check_sorted(&keys_inp, 32);
    }

    #[test]
    fn test_sorting_tile_depth_keys() {
        // Tile id in the high word, depth bits in the low word.
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let num_tiles = 300u64;
        let keys_inp: Vec<u64> = (0..50_000)
            .map(|_| {
                let tile = rng.random_range(0..num_tiles);
                let depth: f32 = rng.random_range(0.2..100.0);
                (tile << 32) | u64::from(depth.to_bits())
            })
            .collect();
        check_sorted(&keys_inp, 32 + bits_needed(num_tiles));
    }

    #[test]
    fn test_sorting_uniform_digits() {
        // Every pass but one sees a single bin and is skipped.
        let keys_inp: Vec<u64> = (0..5000).map(|i| (7 << 40) | (i % 200)).collect();
        check_sorted(&keys_inp, 48);
    }

    #[test]
    fn bits() {
        assert_eq!(bits_needed(0), 0);
        assert_eq!(bits_needed(1), 1);
        assert_eq!(bits_needed(255), 8);
        assert_eq!(bits_needed(256), 9);
    }
}
