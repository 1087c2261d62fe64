// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Ordered set of non-overlapping child ranges with gap and placement queries
//! OWNERS: @kernel-mm-team
//! PUBLIC API: RegionList (insert/remove/find_region/is_range_available/gaps/get_alloc_spot)
//! DEPENDS_ON: alloc::collections::BTreeMap, rand (uniform draws)
//! INVARIANTS: Entries never overlap; no stored range overflows the address width;
//!             gaps are reported in address order with aligned bases
//!
//! Randomized placement treats every aligned offset inside every large enough gap as one
//! candidate slot and picks uniformly among them without materializing the slots. An index
//! is drawn from the entropy budget and located by walking the gaps; when the budget is
//! larger than the number of real slots and the draw misses, a second draw is taken from
//! the real slot count. The combined distribution is uniform over
//! `min(slots, 2^entropy_bits)` lowest slots.

use alloc::collections::btree_map::{self, BTreeMap};
use core::iter::FusedIterator;

use rand::{Rng, RngCore};

use crate::config::MAX_ENTROPY_BITS;
use crate::error::VmError;
use crate::types::{align_up, range_end};

#[derive(Clone, Copy, Debug)]
struct Entry<T> {
    size: usize,
    value: T,
}

/// One child range of a [`RegionList`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Child<T> {
    pub base: usize,
    pub size: usize,
    pub value: T,
}

impl<T> Child<T> {
    /// Exclusive end of the child's range.
    #[inline]
    pub fn end(&self) -> usize {
        // Stored ranges never overflow.
        self.base + self.size
    }

    /// True if the child lies entirely inside `[base, end)`.
    #[inline]
    pub fn within(&self, base: usize, end: usize) -> bool {
        self.base >= base && self.end() <= end
    }
}

/// Children of one region, keyed by base address.
#[derive(Debug)]
pub struct RegionList<T> {
    entries: BTreeMap<usize, Entry<T>>,
}

impl<T> Default for RegionList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RegionList<T> {
    pub const fn new() -> Self {
        Self { entries: BTreeMap::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: Copy> RegionList<T> {
    /// Adds a child. Fails if the range is empty, overflows, or intersects another child.
    pub fn insert(&mut self, base: usize, size: usize, value: T) -> Result<(), VmError> {
        if size == 0 || range_end(base, size).is_none() {
            return Err(VmError::InvalidArgs);
        }
        if !self.is_range_available(base, size) {
            return Err(VmError::InvalidArgs);
        }
        self.entries.insert(base, Entry { size, value });
        Ok(())
    }

    /// Removes the child starting at `base`.
    pub fn remove(&mut self, base: usize) -> Option<T> {
        self.entries.remove(&base).map(|entry| entry.value)
    }

    /// Returns the child whose range contains `addr`.
    pub fn find_region(&self, addr: usize) -> Option<Child<T>> {
        let (&base, entry) = self.entries.range(..=addr).next_back()?;
        let end = range_end(base, entry.size)?;
        (addr < end).then_some(Child { base, size: entry.size, value: entry.value })
    }

    /// True if no child intersects `[base, base + size)`.
    ///
    /// Only the neighbours around `base` are inspected; children never overlap, so no other
    /// entry can reach into the range.
    pub fn is_range_available(&self, base: usize, size: usize) -> bool {
        let Some(end) = range_end(base, size) else {
            return false;
        };
        if let Some((&prev, entry)) = self.entries.range(..=base).next_back() {
            match range_end(prev, entry.size) {
                Some(prev_end) if prev_end <= base => {}
                _ => return false,
            }
        }
        if let Some((&next, _)) = self.entries.range(base..).next() {
            if next < end {
                return false;
            }
        }
        true
    }

    /// Children in address order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = Child<T>> + '_ {
        self.entries.iter().map(|(&base, entry)| Child { base, size: entry.size, value: entry.value })
    }

    /// Children intersecting `[base, base + size)`, in address order.
    pub fn overlapping(&self, base: usize, size: usize) -> impl Iterator<Item = Child<T>> + '_ {
        let end = base.saturating_add(size);
        let start = match self.entries.range(..base).next_back() {
            Some((&prev, entry)) if prev + entry.size > base => prev,
            _ => base,
        };
        self.entries
            .range(start..end)
            .map(|(&base, entry)| Child { base, size: entry.size, value: entry.value })
    }

    /// Lazily enumerates the free spans of `[parent_base, parent_base + parent_size)`.
    ///
    /// Each gap base is rounded up to `1 << align_pow2`; a gap that vanishes after rounding
    /// is skipped. An alignment wider than the address space yields no gaps.
    pub fn gaps(&self, align_pow2: u8, parent_base: usize, parent_size: usize) -> Gaps<'_, T> {
        Gaps {
            children: self.entries.iter(),
            align_pow2,
            cursor: align_up(parent_base, align_pow2),
            parent_end: parent_base.saturating_add(parent_size),
        }
    }

    /// Feeds every gap to `visitor` until it returns `false`.
    pub fn for_each_gap<F>(&self, mut visitor: F, align_pow2: u8, parent_base: usize, parent_size: usize)
    where
        F: FnMut(usize, usize) -> bool,
    {
        for (gap_base, gap_len) in self.gaps(align_pow2, parent_base, parent_size) {
            if !visitor(gap_base, gap_len) {
                break;
            }
        }
    }

    /// Picks a base for a new child of `size` bytes aligned to `1 << align_pow2`.
    ///
    /// Without `rng` the lowest fitting slot is returned. With `rng` the slot is drawn
    /// uniformly from the first `2^entropy_bits` candidates. No slot may end above
    /// `upper_limit`.
    #[allow(clippy::too_many_arguments)]
    pub fn get_alloc_spot(
        &self,
        align_pow2: u8,
        entropy_bits: u8,
        size: usize,
        parent_base: usize,
        parent_size: usize,
        rng: Option<&mut dyn RngCore>,
        upper_limit: usize,
    ) -> Result<usize, VmError> {
        if size == 0 || u32::from(align_pow2) >= usize::BITS {
            return Err(VmError::InvalidArgs);
        }
        let window = SpotWindow { align_pow2, size, parent_base, parent_size, upper_limit };

        let Some(rng) = rng else {
            return self.locate_spot(0, &window).map_err(|_| VmError::NoMemory);
        };

        let budget = 1u64 << entropy_bits.min(MAX_ENTROPY_BITS);
        let index = rng.gen_range(0..budget);
        match self.locate_spot(index, &window) {
            Ok(spot) => Ok(spot),
            Err(0) => Err(VmError::NoMemory),
            Err(total) => {
                let index = rng.gen_range(0..total.min(budget));
                self.locate_spot(index, &window).map_err(|_| VmError::NoMemory)
            }
        }
    }

    /// Walks the gaps looking for candidate slot `index`. On a miss returns the number of
    /// candidate slots seen.
    fn locate_spot(&self, mut index: u64, window: &SpotWindow) -> Result<usize, u64> {
        let mut total = 0u64;
        for (gap_base, gap_len) in self.gaps(window.align_pow2, window.parent_base, window.parent_size) {
            if gap_base >= window.upper_limit {
                break;
            }
            let slots = window.slots_in(gap_base, gap_len);
            if index < slots {
                // index < slots keeps the offset inside the gap.
                return Ok(gap_base + ((index as usize) << window.align_pow2));
            }
            index -= slots;
            total = total.saturating_add(slots);
        }
        Err(total)
    }
}

struct SpotWindow {
    align_pow2: u8,
    size: usize,
    parent_base: usize,
    parent_size: usize,
    upper_limit: usize,
}

impl SpotWindow {
    /// Number of aligned placements of `size` bytes inside the gap, below `upper_limit`.
    fn slots_in(&self, gap_base: usize, gap_len: usize) -> u64 {
        let Some(gap_end) = range_end(gap_base, gap_len) else {
            return 0;
        };
        let usable_end = gap_end.min(self.upper_limit);
        match range_end(gap_base, self.size) {
            Some(spot_end) if spot_end <= usable_end => {
                (((usable_end - spot_end) >> self.align_pow2) as u64).saturating_add(1)
            }
            _ => 0,
        }
    }
}

/// Iterator over the free spans of a region. See [`RegionList::gaps`].
pub struct Gaps<'a, T> {
    children: btree_map::Iter<'a, usize, Entry<T>>,
    align_pow2: u8,
    /// Aligned end of the previous child; `None` once exhausted.
    cursor: Option<usize>,
    parent_end: usize,
}

impl<T> Iterator for Gaps<'_, T> {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let cursor = self.cursor?;
            match self.children.next() {
                Some((&base, entry)) => {
                    self.cursor = range_end(base, entry.size)
                        .and_then(|end| align_up(end, self.align_pow2));
                    if base > cursor {
                        return Some((cursor, base - cursor));
                    }
                }
                None => {
                    self.cursor = None;
                    return (self.parent_end > cursor).then(|| (cursor, self.parent_end - cursor));
                }
            }
        }
    }
}

impl<T> FusedIterator for Gaps<'_, T> {}
