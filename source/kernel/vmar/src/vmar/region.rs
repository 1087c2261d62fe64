// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Composite-region operations (child creation, placement, unmap, protect, reserve)
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Placement, VmarTree::{create_sub_region, create_mapping, unmap,
//!             unmap_allow_partial, protect, reserve_space}
//! DEPENDS_ON: region_list (placement), vmar::mapping (splits), vmar::destroy (teardown)
//! INVARIANTS: Every argument and capability check runs before the first mutation;
//!             range operations never straddle a sub-region boundary unless explicitly allowed

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use rand::RngCore;

use crate::error::VmError;
use crate::flags::{MmuFlags, VmarFlags};
use crate::object::VmObject;
use crate::region_list::Child;
use crate::types::{is_aligned, is_page_aligned, page_align_up, range_end, range_within, NodeId, PAGE_SHIFT};

use super::{MappingData, Node, VmarTree};

/// Where and how large a new child should be.
///
/// `offset` is relative to the parent's base. Without one the child is placed by the
/// parent's allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Placement {
    pub offset: Option<usize>,
    pub size: usize,
    /// log2 of the required alignment; anything below the page shift means page alignment.
    pub align_pow2: u8,
}

impl Placement {
    pub const fn anywhere(size: usize) -> Self {
        Self { offset: None, size, align_pow2: 0 }
    }

    pub const fn at(offset: usize, size: usize) -> Self {
        Self { offset: Some(offset), size, align_pow2: 0 }
    }

    pub const fn aligned(mut self, align_pow2: u8) -> Self {
        self.align_pow2 = align_pow2;
        self
    }

    fn page_size(&self) -> Result<usize, VmError> {
        match page_align_up(self.size) {
            Some(size) if size != 0 => Ok(size),
            _ => Err(VmError::InvalidArgs),
        }
    }

    fn align(&self) -> Result<u8, VmError> {
        if u32::from(self.align_pow2) >= usize::BITS {
            return Err(VmError::InvalidArgs);
        }
        Ok(self.align_pow2.max(PAGE_SHIFT))
    }
}

/// Validates `[base, base + size)` for a range operation and returns its rounded size.
fn checked_range(base: usize, size: usize) -> Result<usize, VmError> {
    if !is_page_aligned(base) {
        return Err(VmError::InvalidArgs);
    }
    let size = page_align_up(size).filter(|size| *size != 0).ok_or(VmError::InvalidArgs)?;
    range_end(base, size).ok_or(VmError::InvalidArgs)?;
    Ok(size)
}

impl VmarTree {
    /// Creates a child region of `parent`.
    ///
    /// The child's CAN_MAP rights must be a subset of the parent's.
    pub fn create_sub_region(
        &mut self,
        parent: NodeId,
        placement: Placement,
        flags: VmarFlags,
        name: &str,
    ) -> Result<NodeId, VmError> {
        if flags.intersects(VmarFlags::MAPPING_ONLY) {
            return Err(VmError::InvalidArgs);
        }
        self.check_child_rights(parent, flags)?;
        let (base, size) = self.place_child(parent, &placement, flags)?;

        let id = self.alloc_node(Node::region(base, size, flags & VmarFlags::PERSISTENT, Some(parent), name));
        self.activate(id)?;
        log::debug!(target: "vmar", "sub-region '{}' [{:#x}, {:#x}) {:?}", name, base, base + size, flags);
        self.debug_verify("create_sub_region");
        Ok(id)
    }

    /// Binds `[object_offset, object_offset + size)` of `object` into `parent` with `prot`.
    ///
    /// With SPECIFIC_OVERWRITE, mappings already in the target range are unmapped first.
    /// With MAP_RANGE, resident object pages are installed right away; if that fails the
    /// new mapping is torn down again.
    #[allow(clippy::too_many_arguments)]
    pub fn create_mapping(
        &mut self,
        parent: NodeId,
        placement: Placement,
        flags: VmarFlags,
        object: Arc<dyn VmObject>,
        object_offset: usize,
        prot: MmuFlags,
    ) -> Result<NodeId, VmError> {
        self.check_child_rights(parent, flags)?;
        if !flags.permits(prot) {
            return Err(VmError::NotSupported);
        }
        if flags.contains(VmarFlags::REQUIRE_NON_RESIZABLE) && object.is_resizable() {
            return Err(VmError::NotSupported);
        }
        let size = placement.page_size()?;
        if !is_page_aligned(object_offset) {
            return Err(VmError::InvalidArgs);
        }
        match range_end(object_offset, size) {
            Some(end) if end <= object.size() => {}
            _ => return Err(VmError::InvalidArgs),
        }

        let (base, size) = self.place_child(parent, &placement, flags)?;
        if flags.contains(VmarFlags::SPECIFIC_OVERWRITE) {
            self.overwrite_range(parent, base, size)?;
        }

        let data = MappingData::new(Some(object), object_offset, prot);
        let id = self.alloc_node(Node::mapping(base, size, flags & VmarFlags::PERSISTENT, parent, data));
        self.activate(id)?;
        log::debug!(
            target: "vmar",
            "mapping [{:#x}, {:#x}) offset={:#x} prot={:?}",
            base,
            base + size,
            object_offset,
            prot
        );

        if flags.contains(VmarFlags::MAP_RANGE) {
            if let Err(err) = self.map_range(id, 0, size, false) {
                let report = self.teardown(id);
                if let Some(undo) = report.first_error {
                    log::warn!(target: "vmar", "map-range undo at {:#x} failed: {}", base, undo);
                }
                self.debug_verify("create_mapping");
                return Err(err);
            }
        }
        self.debug_verify("create_mapping");
        Ok(id)
    }

    /// Removes `[base, base + size)` from `node`.
    ///
    /// On a region the range must lie inside it and must not cut through a sub-region.
    /// Fully covered children are destroyed, partially covered mappings are split. On a
    /// mapping the covered part is split off and destroyed.
    pub fn unmap(&mut self, node: NodeId, base: usize, size: usize) -> Result<(), VmError> {
        let size = checked_range(base, size)?;
        let target = self.arena.live(node)?;
        if !range_within(base, size, target.base, target.size) {
            return Err(VmError::InvalidArgs);
        }
        let result = if target.is_region() {
            self.unmap_in_region(node, base, size)
        } else {
            self.unmap_mapping_range(node, base, base + size)
        };
        self.debug_verify("unmap");
        result
    }

    fn unmap_in_region(&mut self, region: NodeId, base: usize, size: usize) -> Result<(), VmError> {
        let end = base + size;
        let hits = self.overlapping_children(region, base, size)?;
        for child in &hits {
            if self.arena.live(child.value)?.is_region() && !child.within(base, end) {
                return Err(VmError::InvalidArgs);
            }
        }

        let mut first_error = None;
        for child in hits {
            let result = if child.within(base, end) {
                self.teardown(child.value).into_result().map(|_| ())
            } else {
                self.unmap_mapping_range(child.value, base.max(child.base), end.min(child.end()))
            };
            if let Err(err) = result {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Like [`unmap`](Self::unmap) on a region, but descends into partially covered
    /// sub-regions instead of rejecting them. Only fully covered children are destroyed.
    pub fn unmap_allow_partial(&mut self, region: NodeId, base: usize, size: usize) -> Result<(), VmError> {
        let size = checked_range(base, size)?;
        let end = base + size;
        let node = self.arena.live(region)?;
        node.as_region()?;
        if !range_within(base, size, node.base, node.size) {
            return Err(VmError::InvalidArgs);
        }

        let mut first_error = None;
        let mut worklist = vec![region];
        while let Some(current) = worklist.pop() {
            for child in self.overlapping_children(current, base, size)? {
                let result = if child.within(base, end) {
                    self.teardown(child.value).into_result().map(|_| ())
                } else if self.arena.live(child.value)?.is_region() {
                    worklist.push(child.value);
                    Ok(())
                } else {
                    self.unmap_mapping_range(child.value, base.max(child.base), end.min(child.end()))
                };
                if let Err(err) = result {
                    first_error.get_or_insert(err);
                }
            }
        }
        self.debug_verify("unmap_allow_partial");
        first_error.map_or(Ok(()), Err)
    }

    /// Changes the protection of `[base, base + size)`.
    ///
    /// On a region the range must be covered by mappings without holes and must not touch
    /// any sub-region. Every covered mapping must permit `prot`. Mappings only partially
    /// covered are split at the range boundary.
    pub fn protect(&mut self, node: NodeId, base: usize, size: usize, prot: MmuFlags) -> Result<(), VmError> {
        let size = checked_range(base, size)?;
        let end = base + size;
        let target = self.arena.live(node)?;
        if !range_within(base, size, target.base, target.size) {
            return Err(VmError::InvalidArgs);
        }

        let mappings = if target.is_region() {
            self.covering_mappings(node, base, end)?
        } else {
            vec![node]
        };
        for id in &mappings {
            if !self.arena.live(*id)?.flags.permits(prot) {
                return Err(VmError::NotSupported);
            }
        }

        let mut result = Ok(());
        for id in mappings {
            let (child_base, child_end) = {
                let mapping = self.arena.live(id)?;
                (mapping.base, mapping.end())
            };
            result = self.protect_mapping_range(id, base.max(child_base), end.min(child_end), prot);
            if result.is_err() {
                break;
            }
        }
        self.debug_verify("protect");
        result
    }

    /// Mappings of `region` covering `[base, end)` without holes.
    fn covering_mappings(&self, region: NodeId, base: usize, end: usize) -> Result<Vec<NodeId>, VmError> {
        let hits = self.overlapping_children(region, base, end - base)?;
        let mut cursor = base;
        for child in &hits {
            if self.arena.live(child.value)?.is_region() {
                return Err(VmError::InvalidArgs);
            }
            if child.base > cursor {
                return Err(VmError::NotFound);
            }
            cursor = child.end();
        }
        if cursor < end {
            return Err(VmError::NotFound);
        }
        Ok(hits.into_iter().map(|child| child.value).collect())
    }

    /// Wraps translations already present in `[base, base + size)` in an object-less
    /// mapping and applies `hw_flags` to them.
    ///
    /// `hw_flags` must grant some access. Reserved mappings never fault pages in.
    /// Destroying one removes the translations.
    pub fn reserve_space(
        &mut self,
        region: NodeId,
        name: &str,
        base: usize,
        size: usize,
        hw_flags: MmuFlags,
    ) -> Result<NodeId, VmError> {
        let size = checked_range(base, size)?;
        if !hw_flags.is_accessible() {
            return Err(VmError::InvalidArgs);
        }
        let flags = VmarFlags::required_for(hw_flags);
        {
            let node = self.arena.live(region)?;
            let children = &node.as_region()?.children;
            if !range_within(base, size, node.base, node.size) || !children.is_range_available(base, size) {
                return Err(VmError::InvalidArgs);
            }
            if !node.flags.contains(flags) {
                return Err(VmError::NotSupported);
            }
        }

        self.mmu.protect(base, size, hw_flags)?;
        let data = MappingData::new(None, 0, hw_flags);
        let id = self.alloc_node(Node::mapping(base, size, flags, region, data));
        self.activate(id)?;
        log::debug!(target: "vmar", "reserved '{}' [{:#x}, {:#x}) {:?}", name, base, base + size, hw_flags);
        self.debug_verify("reserve_space");
        Ok(id)
    }

    /// Rejects requests for rights the parent does not hold.
    fn check_child_rights(&self, parent: NodeId, flags: VmarFlags) -> Result<(), VmError> {
        let parent = self.arena.live(parent)?;
        parent.as_region()?;
        if !parent.flags.can_map().contains(flags.can_map()) {
            return Err(VmError::NotSupported);
        }
        Ok(())
    }

    /// Resolves a placement request against `parent` into an absolute `(base, size)`.
    fn place_child(
        &mut self,
        parent: NodeId,
        placement: &Placement,
        flags: VmarFlags,
    ) -> Result<(usize, usize), VmError> {
        let size = placement.page_size()?;
        let align_pow2 = placement.align()?;
        let node = self.arena.live(parent)?;
        let children = &node.as_region()?.children;
        let specific = flags.intersects(VmarFlags::SPECIFIC | VmarFlags::SPECIFIC_OVERWRITE);
        let upper_limit = flags.contains(VmarFlags::OFFSET_IS_UPPER_LIMIT);

        match placement.offset {
            Some(offset) if !upper_limit => {
                if !is_page_aligned(offset) || !is_aligned(offset, align_pow2) {
                    return Err(VmError::InvalidArgs);
                }
                let base = node.base.checked_add(offset).ok_or(VmError::InvalidArgs)?;
                if !range_within(base, size, node.base, node.size) {
                    return Err(VmError::InvalidArgs);
                }
                if !flags.contains(VmarFlags::SPECIFIC_OVERWRITE) && !children.is_range_available(base, size) {
                    return Err(VmError::InvalidArgs);
                }
                Ok((base, size))
            }
            Some(_) if specific => Err(VmError::InvalidArgs),
            None if specific || upper_limit => Err(VmError::InvalidArgs),
            offset => {
                let parent_end = node.end();
                let limit = match offset {
                    Some(limit) => node.base.saturating_add(limit).min(parent_end),
                    None => parent_end,
                };
                let compact = flags.contains(VmarFlags::COMPACT) || node.flags.contains(VmarFlags::COMPACT);
                let entropy_bits = self.aslr.entropy_for(compact);
                let rng = self.rng.as_deref_mut().map(|rng| rng as &mut dyn RngCore);
                let base = children.get_alloc_spot(align_pow2, entropy_bits, size, node.base, node.size, rng, limit)?;
                Ok((base, size))
            }
        }
    }

    /// Clears mappings out of `[base, base + size)` ahead of an overwriting mapping.
    fn overwrite_range(&mut self, region: NodeId, base: usize, size: usize) -> Result<(), VmError> {
        for child in self.overlapping_children(region, base, size)? {
            if self.arena.live(child.value)?.is_region() {
                return Err(VmError::InvalidArgs);
            }
        }
        self.unmap_in_region(region, base, size)
    }

    pub(super) fn overlapping_children(
        &self,
        region: NodeId,
        base: usize,
        size: usize,
    ) -> Result<Vec<Child<NodeId>>, VmError> {
        let region = self.arena.live(region)?.as_region()?;
        Ok(region.children.overlapping(base, size).collect())
    }
}
