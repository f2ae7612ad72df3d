//! Address ranges and the allocators carving them up.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Half-open physical address range `[start, start + size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct HpaRange {
    /// First byte of the range.
    pub start: u64,
    /// Length in bytes.
    pub size: u64,
}

impl HpaRange {
    /// Creates a range from its start and length.
    #[must_use]
    pub const fn new(start: u64, size: u64) -> Self {
        Self { start, size }
    }

    /// Exclusive end address, saturating at `u64::MAX`.
    #[must_use]
    pub const fn end(self) -> u64 {
        self.start.saturating_add(self.size)
    }

    /// Returns `true` when the range covers no bytes.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.size == 0
    }

    /// Returns `true` when `other` lies entirely inside `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        other.start >= self.start && other.end() <= self.end()
    }

    /// Returns `true` when the two ranges share at least one byte.
    #[must_use]
    pub const fn overlaps(self, other: Self) -> bool {
        !self.is_empty() && !other.is_empty() && self.start < other.end() && other.start < self.end()
    }
}

impl fmt::Display for HpaRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "[{:#x}, empty]", self.start)
        } else {
            write!(f, "[{:#x}-{:#x}]", self.start, self.end() - 1)
        }
    }
}

/// First-fit allocator over one contiguous window.
///
/// Allocations are aligned to the pool's alignment and sized in multiples of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressPool {
    window: HpaRange,
    align: u64,
    free: BTreeMap<u64, u64>,
}

impl AddressPool {
    /// Creates a pool covering all of `window`.
    #[must_use]
    pub fn new(window: HpaRange, align: u64) -> Self {
        let mut free = BTreeMap::new();
        if !window.is_empty() {
            free.insert(window.start, window.size);
        }
        Self {
            window,
            align: align.max(1),
            free,
        }
    }

    /// Window the pool was created over.
    #[must_use]
    pub const fn window(&self) -> HpaRange {
        self.window
    }

    /// Bytes not currently allocated.
    #[must_use]
    pub fn available(&self) -> u64 {
        self.free.values().sum()
    }

    /// Allocates `size` bytes at the lowest aligned address that fits.
    ///
    /// Returns `None` for zero or misaligned sizes and when no block fits.
    pub fn alloc(&mut self, size: u64) -> Option<HpaRange> {
        if size == 0 || !size.is_multiple_of(self.align) {
            return None;
        }
        let (block_start, block_size, aligned) = self.free.iter().find_map(|(&start, &len)| {
            let aligned = start.checked_next_multiple_of(self.align)?;
            let end = start.checked_add(len)?;
            (aligned.checked_add(size)? <= end).then_some((start, len, aligned))
        })?;
        self.free.remove(&block_start);
        if aligned > block_start {
            self.free.insert(block_start, aligned - block_start);
        }
        let tail = block_start + block_size - (aligned + size);
        if tail > 0 {
            self.free.insert(aligned + size, tail);
        }
        Some(HpaRange::new(aligned, size))
    }

    /// Returns `range` to the pool, merging it with adjacent free blocks.
    pub fn free(&mut self, range: HpaRange) {
        if range.is_empty() {
            return;
        }
        let mut start = range.start;
        let mut size = range.size;
        if let Some((&prev_start, &prev_size)) = self.free.range(..start).next_back() {
            if prev_start + prev_size == start {
                self.free.remove(&prev_start);
                start = prev_start;
                size += prev_size;
            }
        }
        if let Some(&next_size) = self.free.get(&(start + size)) {
            self.free.remove(&(start + size));
            size += next_size;
        }
        self.free.insert(start, size);
    }
}

/// Busy-range bookkeeping for one platform window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceTree {
    window: HpaRange,
    busy: BTreeMap<u64, (u64, String)>,
}

impl ResourceTree {
    /// Creates an empty tree over `window`.
    #[must_use]
    pub const fn new(window: HpaRange) -> Self {
        Self {
            window,
            busy: BTreeMap::new(),
        }
    }

    /// Marks `range` busy under `owner`.
    ///
    /// Returns `false` when the range leaves the window or overlaps a busy range.
    pub fn request(&mut self, range: HpaRange, owner: &str) -> bool {
        if range.is_empty() || !self.window.contains(range) {
            return false;
        }
        let clash = self
            .busy
            .iter()
            .any(|(&start, &(size, _))| HpaRange::new(start, size).overlaps(range));
        if clash {
            return false;
        }
        self.busy.insert(range.start, (range.size, owner.to_owned()));
        true
    }

    /// Releases a range previously granted by [`Self::request`].
    pub fn release(&mut self, range: HpaRange) -> bool {
        match self.busy.get(&range.start) {
            Some(&(size, _)) if size == range.size => {
                self.busy.remove(&range.start);
                true
            }
            _ => false,
        }
    }

    /// Owner of the busy range starting at `start`, if any.
    #[must_use]
    pub fn owner(&self, start: u64) -> Option<&str> {
        self.busy.get(&start).map(|(_, owner)| owner.as_str())
    }
}

/// Lowest-free integer id allocator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdAllocator {
    taken: BTreeSet<u32>,
}

impl IdAllocator {
    /// Creates an allocator with every id free.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            taken: BTreeSet::new(),
        }
    }

    /// Takes the lowest free id.
    pub fn alloc(&mut self) -> Option<u32> {
        let id = (0..=u32::MAX).find(|id| !self.taken.contains(id))?;
        self.taken.insert(id);
        Some(id)
    }

    /// Returns `id` to the free set.
    pub fn free(&mut self, id: u32) -> bool {
        self.taken.remove(&id)
    }

    /// Returns `true` while `id` is allocated.
    #[must_use]
    pub fn is_taken(&self, id: u32) -> bool {
        self.taken.contains(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::{AddressPool, HpaRange, IdAllocator, ResourceTree};

    const ALIGN: u64 = 0x1000_0000;

    #[test]
    fn pool_allocates_first_fit_and_coalesces_on_free() {
        let window = HpaRange::new(0x10_0000_0000, 4 * ALIGN);
        let mut pool = AddressPool::new(window, ALIGN);

        let a = pool.alloc(ALIGN).expect("first block");
        let b = pool.alloc(2 * ALIGN).expect("second block");
        assert_eq!(a.start, window.start);
        assert_eq!(b.start, window.start + ALIGN);
        assert_eq!(pool.available(), ALIGN);

        pool.free(a);
        pool.free(b);
        assert_eq!(pool.available(), 4 * ALIGN);
        assert_eq!(pool.alloc(4 * ALIGN), Some(window));
    }

    #[test]
    fn pool_rejects_misaligned_and_oversized_requests() {
        let mut pool = AddressPool::new(HpaRange::new(0, 2 * ALIGN), ALIGN);
        assert_eq!(pool.alloc(0), None);
        assert_eq!(pool.alloc(ALIGN / 2), None);
        assert_eq!(pool.alloc(3 * ALIGN), None);
    }

    #[test]
    fn pool_aligns_inside_unaligned_window() {
        let mut pool = AddressPool::new(HpaRange::new(0x800_0000, 2 * ALIGN), ALIGN);
        let range = pool.alloc(ALIGN).expect("aligned block");
        assert_eq!(range.start, ALIGN);
        assert_eq!(pool.available(), ALIGN);
    }

    #[test]
    fn resource_tree_refuses_overlap_and_out_of_window() {
        let window = HpaRange::new(0x1000, 0x4000);
        let mut tree = ResourceTree::new(window);
        assert!(tree.request(HpaRange::new(0x1000, 0x1000), "region0.0:0"));
        assert!(!tree.request(HpaRange::new(0x1800, 0x1000), "region0.0:1"));
        assert!(!tree.request(HpaRange::new(0x4800, 0x1000), "region0.0:1"));
        assert_eq!(tree.owner(0x1000), Some("region0.0:0"));
        assert!(tree.release(HpaRange::new(0x1000, 0x1000)));
        assert!(!tree.release(HpaRange::new(0x1000, 0x1000)));
    }

    #[test]
    fn ids_are_handed_out_lowest_first() {
        let mut ids = IdAllocator::new();
        assert_eq!(ids.alloc(), Some(0));
        assert_eq!(ids.alloc(), Some(1));
        assert_eq!(ids.alloc(), Some(2));
        assert!(ids.free(1));
        assert!(!ids.is_taken(1));
        assert_eq!(ids.alloc(), Some(1));
        assert_eq!(ids.alloc(), Some(3));
    }

    #[test]
    fn range_display_and_overlap() {
        let range = HpaRange::new(0x1000, 0x1000);
        assert_eq!(range.to_string(), "[0x1000-0x1fff]");
        assert!(range.overlaps(HpaRange::new(0x1fff, 1)));
        assert!(!range.overlaps(HpaRange::new(0x2000, 1)));
        assert!(!range.overlaps(HpaRange::new(0x1800, 0)));
    }
}
