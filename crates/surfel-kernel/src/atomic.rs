use std::sync::atomic::{AtomicU32, Ordering};

/// An `f32` that many workers can add into concurrently.
///
/// Addition goes through a compare-and-swap loop on the bit pattern. The result only depends
/// on the set of values added, up to float rounding, not on which worker got there first.
#[derive(Debug, Default)]
#[repr(transparent)]
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    pub const fn zero() -> Self {
        Self(AtomicU32::new(0))
    }

    pub fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    #[inline]
    pub fn add(&self, value: f32) {
        if value == 0.0 {
            return;
        }
        let mut cur = self.0.load(Ordering::Relaxed);
        loop {
            let next = (f32::from_bits(cur) + value).to_bits();
            match self
                .0
                .compare_exchange_weak(cur, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    #[inline]
    pub fn max(&self, value: f32) {
        let mut cur = self.0.load(Ordering::Relaxed);
        while value > f32::from_bits(cur) {
            match self.0.compare_exchange_weak(
                cur,
                value.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// `len` accumulators, all zero.
pub fn accumulators(len: usize) -> Vec<AtomicF32> {
    (0..len).map(|_| AtomicF32::zero()).collect()
}

/// Copy settled accumulator values out into a plain buffer.
pub fn read_accumulators(acc: &[AtomicF32], out: &mut [f32]) {
    assert_eq!(
        acc.len(),
        out.len(),
        "Accumulator and output lengths must match"
    );
    for (o, a) in out.iter_mut().zip(acc) {
        *o = a.load();
    }
}
