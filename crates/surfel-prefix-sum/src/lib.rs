use rayon::prelude::*;
use surfel_kernel::GROUP_SIZE;

fn scan_group(input: &[u32], output: &mut [u32]) {
    let mut acc = 0u32;
    for (o, &i) in output.iter_mut().zip(input) {
        acc += i;
        *o = acc;
    }
}

/// Inclusive prefix sum of `input` into `output`.
///
/// Groups of [`GROUP_SIZE`] elements are scanned in parallel, the per-group totals are scanned
/// recursively and then added back onto every group but the first.
pub fn prefix_sum(input: &[u32], output: &mut [u32]) {
    assert_eq!(
        input.len(),
        output.len(),
        "Prefix sum input and output must have the same length"
    );

    if input.len() <= GROUP_SIZE {
        scan_group(input, output);
        return;
    }

    output
        .par_chunks_mut(GROUP_SIZE)
        .zip(input.par_chunks(GROUP_SIZE))
        .for_each(|(out, inp)| scan_group(inp, out));

    let group_sums: Vec<u32> = output
        .chunks(GROUP_SIZE)
        .map(|group| group.last().copied().unwrap_or(0))
        .collect();
    let mut scanned_sums = vec![0; group_sums.len()];
    prefix_sum(&group_sums, &mut scanned_sums);

    output
        .par_chunks_mut(GROUP_SIZE)
        .skip(1)
        .zip(scanned_sums.par_iter())
        .for_each(|(group, &offset)| {
            for v in group {
                *v += offset;
            }
        });
}
