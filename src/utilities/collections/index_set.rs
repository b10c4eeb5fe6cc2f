/// Collection of unique indices supporting add, remove, and contains operations.
/// Uses packed bitfields where each bit represents one index's containment state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IndexSet {
    /// Packed bitfields representing index containment.
    flags: Vec<u64>,
}

impl IndexSet {
    const SHIFT: u32 = 6;
    const MASK: u32 = 63;

    /// Gets the bundle capacity needed for the given count.
    #[inline(always)]
    pub fn get_bundle_capacity(count: usize) -> usize {
        (count + Self::MASK as usize) >> Self::SHIFT
    }

    /// Creates a new IndexSet able to hold indices below `initial_capacity` without resizing.
    pub fn new(initial_capacity: usize) -> Self {
        Self {
            flags: vec![0; Self::get_bundle_capacity(initial_capacity)],
        }
    }

    /// Checks if an index is contained in the set.
    #[inline(always)]
    pub fn contains(&self, index: u32) -> bool {
        let packed_index = (index >> Self::SHIFT) as usize;
        packed_index < self.flags.len()
            && (self.flags[packed_index] & (1u64 << (index & Self::MASK))) != 0
    }

    /// Gets whether the set could hold the specified indices, i.e. none of them are already present.
    #[inline(always)]
    pub fn can_fit(&self, index_list: &[u32]) -> bool {
        index_list.iter().all(|&index| !self.contains(index))
    }

    /// Adds an index to the set, growing the backing storage if required.
    #[inline(always)]
    pub fn add(&mut self, index: u32) {
        let bundle_index = (index >> Self::SHIFT) as usize;
        if bundle_index >= self.flags.len() {
            let new_capacity = (bundle_index + 1).next_power_of_two();
            self.flags.resize(new_capacity, 0);
        }
        debug_assert!(
            (self.flags[bundle_index] & (1u64 << (index & Self::MASK))) == 0,
            "Cannot add if it's already present!"
        );
        self.flags[bundle_index] |= 1u64 << (index & Self::MASK);
    }

    /// Removes an index from the set.
    #[inline(always)]
    pub fn remove(&mut self, index: u32) {
        debug_assert!(
            self.contains(index),
            "If you try to remove an index, it should be present."
        );
        self.flags[(index >> Self::SHIFT) as usize] &= !(1u64 << (index & Self::MASK));
    }

    /// Clears all indices from the set while keeping the backing storage.
    #[inline(always)]
    pub fn clear(&mut self) {
        self.flags.iter_mut().for_each(|bundle| *bundle = 0);
    }

    /// Counts the indices contained in the set.
    pub fn count(&self) -> usize {
        self.flags.iter().map(|bundle| bundle.count_ones() as usize).sum()
    }
}
