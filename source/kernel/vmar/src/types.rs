// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Shared newtypes and checked address arithmetic for the region tree
//! OWNERS: @kernel-mm-team
//! PUBLIC API: NodeId, LifeCycle, PAGE_SIZE, PAGE_SHIFT, alignment helpers
//! INVARIANTS: No helper wraps; overflow is reported as `None`

use core::num::NonZeroU32;

/// log2 of the page size.
pub const PAGE_SHIFT: u8 = 12;
/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
/// Longest region name kept, in bytes.
pub const MAX_NAME_LEN: usize = 32;

/// Handle to a node of a [`VmarTree`](crate::VmarTree).
///
/// Handles carry the generation of the arena slot they were issued for. Once the node is
/// destroyed the slot generation moves on and the handle no longer resolves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: u32,
    generation: NonZeroU32,
}

impl NodeId {
    pub(crate) const fn new(index: u32, generation: NonZeroU32) -> Self {
        Self { index, generation }
    }

    #[inline]
    pub(crate) const fn index(self) -> usize {
        self.index as usize
    }

    #[inline]
    pub(crate) const fn generation(self) -> NonZeroU32 {
        self.generation
    }
}

/// Lifecycle of a region or mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifeCycle {
    /// Allocated but not yet linked into its parent.
    NotReady,
    /// Linked into the tree; base and size describe the installed range.
    Alive,
    /// Destroyed. Nothing else about the node may be queried.
    Dead,
}

#[inline]
pub const fn is_page_aligned(value: usize) -> bool {
    value & (PAGE_SIZE - 1) == 0
}

#[inline]
pub const fn page_align_down(value: usize) -> usize {
    value & !(PAGE_SIZE - 1)
}

#[inline]
pub fn page_align_up(value: usize) -> Option<usize> {
    align_up(value, PAGE_SHIFT)
}

/// Rounds `value` up to a multiple of `1 << align_pow2`.
///
/// `None` if the result overflows or the alignment exceeds the address width.
#[inline]
pub fn align_up(value: usize, align_pow2: u8) -> Option<usize> {
    let mask = 1usize.checked_shl(u32::from(align_pow2))? - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

/// True if `value` is a multiple of `1 << align_pow2`. Only zero satisfies an alignment
/// wider than the address space.
#[inline]
pub const fn is_aligned(value: usize, align_pow2: u8) -> bool {
    match 1usize.checked_shl(align_pow2 as u32) {
        Some(align) => value & (align - 1) == 0,
        None => value == 0,
    }
}

/// Exclusive end of `[base, base + size)`, or `None` if it does not fit the address width.
#[inline]
pub fn range_end(base: usize, size: usize) -> Option<usize> {
    base.checked_add(size)
}

/// True if `[base, base + size)` lies within `[outer_base, outer_base + outer_size)`.
#[inline]
pub fn range_within(base: usize, size: usize, outer_base: usize, outer_size: usize) -> bool {
    match (range_end(base, size), range_end(outer_base, outer_size)) {
        (Some(end), Some(outer_end)) => base >= outer_base && end <= outer_end,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_reports_overflow() {
        assert_eq!(align_up(0x1001, PAGE_SHIFT), Some(0x2000));
        assert_eq!(align_up(0x2000, PAGE_SHIFT), Some(0x2000));
        assert_eq!(align_up(usize::MAX - 10, PAGE_SHIFT), None);
    }

    #[test]
    fn alignments_wider_than_the_address_space() {
        let bits = usize::BITS as u8;
        assert_eq!(align_up(0x1000, bits), None);
        assert_eq!(align_up(0, u8::MAX), None);
        assert!(is_aligned(0, bits));
        assert!(!is_aligned(0x1000, bits));
        assert!(is_aligned(0x1000, PAGE_SHIFT));
    }

    #[test]
    fn range_within_rejects_overflowing_ranges() {
        assert!(range_within(0x1000, 0x1000, 0, 0x1_0000));
        assert!(!range_within(0xf000, 0x2000, 0, 0x1_0000));
        assert!(!range_within(usize::MAX - 1, 2, 0, usize::MAX));
    }
}
