use std::marker::PhantomData;

/// A mutable slice that parallel workers write into at distinct indices.
///
/// This is how a worker-per-element pass scatters into a shared output (sorted entries, the
/// pixels of one tile) without splitting the slice into contiguous chunks up front.
pub struct DisjointSlice<'a, T> {
    ptr: *mut T,
    len: usize,
    _marker: PhantomData<&'a mut [T]>,
}

// SAFETY: The slice is exclusively borrowed for 'a, and `write` requires callers to never
// write the same index from two workers, so sharing the handle can't produce a data race.
unsafe impl<T: Send> Sync for DisjointSlice<'_, T> {}
// SAFETY: See above, the handle is just an exclusive borrow.
unsafe impl<T: Send> Send for DisjointSlice<'_, T> {}

impl<'a, T: Copy> DisjointSlice<'a, T> {
    pub fn new(slice: &'a mut [T]) -> Self {
        Self {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
            _marker: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Write `value` at `index`.
    ///
    /// # Safety
    ///
    /// No other worker may write or read `index` while this handle is alive.
    #[inline]
    pub unsafe fn write(&self, index: usize, value: T) {
        assert!(
            index < self.len,
            "Disjoint write out of bounds: {index} >= {}",
            self.len
        );
        // SAFETY: In bounds per the assert above, exclusive per the caller contract.
        unsafe { self.ptr.add(index).write(value) };
    }
}
