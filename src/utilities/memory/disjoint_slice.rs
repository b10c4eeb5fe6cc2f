use std::marker::PhantomData;

/// Shared view of a mutable slice for parallel stages whose work units write provably disjoint elements.
///
/// The view itself enforces nothing. Callers must guarantee that no element is written by one work unit
/// while another work unit reads or writes it. Within the solver that guarantee comes from the island
/// partition, the constraint coloring and the non-overlapping ranges handed out by `parallel_for`.
pub struct DisjointSlice<'a, T> {
    ptr: *mut T,
    len: usize,
    _marker: PhantomData<&'a mut [T]>,
}

unsafe impl<T: Send> Send for DisjointSlice<'_, T> {}
unsafe impl<T: Send + Sync> Sync for DisjointSlice<'_, T> {}

impl<'a, T> DisjointSlice<'a, T> {
    #[inline(always)]
    pub fn new(slice: &'a mut [T]) -> Self {
        Self {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
            _marker: PhantomData,
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reads an element.
    ///
    /// # Safety
    /// No other work unit may be writing `index` concurrently.
    #[inline(always)]
    pub unsafe fn get(&self, index: usize) -> &T {
        debug_assert!(index < self.len);
        &*self.ptr.add(index)
    }

    /// Gets exclusive access to an element.
    ///
    /// # Safety
    /// No other work unit may access `index` while the returned reference is alive.
    #[allow(clippy::mut_from_ref)]
    #[inline(always)]
    pub unsafe fn get_mut(&self, index: usize) -> &mut T {
        debug_assert!(index < self.len);
        &mut *self.ptr.add(index)
    }

    /// Gets exclusive access to a contiguous range.
    ///
    /// # Safety
    /// No other work unit may access any element of `range` while the returned slice is alive.
    #[allow(clippy::mut_from_ref)]
    #[inline(always)]
    pub unsafe fn slice_mut(&self, range: std::ops::Range<usize>) -> &mut [T] {
        debug_assert!(range.start <= range.end && range.end <= self.len);
        std::slice::from_raw_parts_mut(self.ptr.add(range.start), range.end - range.start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utilities::thread_dispatcher::{parallel_for, ThreadDispatcher};

    #[test]
    fn disjoint_ranges_write_in_parallel() {
        let mut values = vec![0u32; 512];
        let dispatcher = ThreadDispatcher::new(3);
        {
            let view = DisjointSlice::new(&mut values);
            parallel_for(Some(&dispatcher), view.len(), 16, &|range| {
                let start = range.start;
                let chunk = unsafe { view.slice_mut(range) };
                for (offset, value) in chunk.iter_mut().enumerate() {
                    *value = (start + offset) as u32 * 2;
                }
            });
        }
        assert!(values.iter().enumerate().all(|(i, &v)| v == i as u32 * 2));
    }
}
