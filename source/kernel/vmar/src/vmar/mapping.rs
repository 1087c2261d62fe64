// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Leaf-mapping operations (faults, map-range, splits, attribution)
//! OWNERS: @kernel-mm-team
//! PUBLIC API: VmarTree::{page_fault, map_range, attributed_pages}
//! DEPENDS_ON: object::VmObject (object lock), mmu::ArchMmu
//! INVARIANTS: A split keeps both pieces contiguous and adjusts the right piece's object
//!             offset; splits never touch installed translations; the attribution cache is
//!             only trusted while both generations are unchanged

use alloc::vec;

use crate::error::VmError;
use crate::flags::{FaultFlags, MmuFlags};
use crate::types::{is_page_aligned, page_align_down, range_end, NodeId, PAGE_SIZE};

use super::{AttributionCache, MappingData, Node, NodeKind, VmarTree};

impl VmarTree {
    /// Resolves a fault at `va` against the mapping covering it.
    ///
    /// Returns [`VmError::ShouldWait`] when the object has to fetch the page out of line.
    /// Drop the address-space lock, wait for the supply and retry.
    pub fn page_fault(&mut self, va: usize, flags: FaultFlags) -> Result<(), VmError> {
        let Some(id) = self.find_mapping(va) else {
            log::trace!(target: "vmar::fault", "fault {:#x} {:?}: no mapping", va, flags);
            return Err(VmError::NotFound);
        };
        let (object, offset, arch_flags) = {
            let node = self.arena.live(id)?;
            let mapping = node.as_mapping()?;
            if !mapping.arch_flags.contains(flags.required_protection()) {
                log::trace!(target: "vmar::fault", "fault {:#x} {:?}: denied by {:?}", va, flags, mapping.arch_flags);
                return Err(VmError::AccessDenied);
            }
            let Some(object) = mapping.object.clone() else {
                return Err(VmError::AccessDenied);
            };
            let offset = mapping.object_offset + (page_align_down(va) - node.base);
            (object, offset, mapping.arch_flags)
        };

        let pa = match object.get_page(offset, flags) {
            Ok(pa) => pa,
            Err(err) => {
                log::trace!(target: "vmar::fault", "fault {:#x}: object offset {:#x}: {}", va, offset, err);
                return Err(err);
            }
        };
        self.install(page_align_down(va), pa, arch_flags)?;
        log::trace!(target: "vmar::fault", "fault {:#x} -> pa {:#x} {:?}", va, pa, arch_flags);
        Ok(())
    }

    /// Installs translations for `[offset, offset + len)` of `mapping`, relative to its base.
    ///
    /// Without `commit` only pages already resident in the object are installed. With
    /// `commit` missing pages are requested from the object, which may answer
    /// [`VmError::ShouldWait`]; pages installed before that stay installed and a retry
    /// picks up where it stopped.
    pub fn map_range(&mut self, mapping: NodeId, offset: usize, len: usize, commit: bool) -> Result<(), VmError> {
        if len == 0 || !is_page_aligned(offset) || !is_page_aligned(len) {
            return Err(VmError::InvalidArgs);
        }
        let (base, object, object_offset, arch_flags) = {
            let node = self.arena.live(mapping)?;
            let data = node.as_mapping()?;
            match range_end(offset, len) {
                Some(end) if end <= node.size => {}
                _ => return Err(VmError::InvalidArgs),
            }
            let object = data.object.clone().ok_or(VmError::NotSupported)?;
            (node.base, object, data.object_offset, data.arch_flags)
        };
        if !arch_flags.is_accessible() {
            return Ok(());
        }

        for page in (offset..offset + len).step_by(PAGE_SIZE) {
            let pa = if commit {
                object.get_page(object_offset + page, FaultFlags::empty())?
            } else {
                match object.lookup_page(object_offset + page) {
                    Some(pa) => pa,
                    None => continue,
                }
            };
            self.install(base + page, pa, arch_flags)?;
        }
        Ok(())
    }

    /// Installs `va -> pa`, replacing a stale translation. Repeating it is a no-op.
    fn install(&mut self, va: usize, pa: usize, flags: MmuFlags) -> Result<(), VmError> {
        match self.mmu.query(va) {
            Some(current) if current.pa == pa && current.flags == flags => return Ok(()),
            Some(_) => {
                self.mmu.unmap(va, PAGE_SIZE)?;
            }
            None => {}
        }
        self.mmu.map(va, pa, flags)?;
        Ok(())
    }

    /// Number of resident object pages attributed to `node`.
    ///
    /// For a mapping the answer is cached and recomputed only after the mapping or its
    /// object changed generation. For a region it is the sum over all mappings below it.
    pub fn attributed_pages(&self, node: NodeId) -> Result<usize, VmError> {
        let start = self.arena.live(node)?;
        if let NodeKind::Mapping(mapping) = &start.kind {
            return Ok(mapping_attribution(start, mapping));
        }

        let mut total = 0usize;
        let mut worklist = vec![node];
        while let Some(current) = worklist.pop() {
            let Some(current) = self.arena.get(current) else {
                continue;
            };
            match &current.kind {
                NodeKind::Mapping(mapping) => total += mapping_attribution(current, mapping),
                NodeKind::Region(region) => worklist.extend(region.children.iter().map(|child| child.value)),
            }
        }
        Ok(total)
    }

    /// Splits a mapping at `at`, which must lie strictly inside it. The mapping keeps
    /// `[base, at)`; the returned mapping covers `[at, end)`.
    pub(super) fn split_mapping(&mut self, id: NodeId, at: usize) -> Result<NodeId, VmError> {
        let (base, end, flags, parent, right) = {
            let node = self.arena.live(id)?;
            let mapping = node.as_mapping()?;
            if at <= node.base || at >= node.end() || !is_page_aligned(at) {
                return Err(VmError::InvalidArgs);
            }
            let parent = node.parent.ok_or(VmError::BadState)?;
            let right = MappingData::new(
                mapping.object.clone(),
                mapping.object_offset + (at - node.base),
                mapping.arch_flags,
            );
            (node.base, node.end(), node.flags, parent, right)
        };

        {
            let children = &mut self.arena.live_mut(parent)?.as_region_mut()?.children;
            children.remove(base);
            children.insert(base, at - base, id)?;
        }
        let left = self.arena.live_mut(id)?;
        left.size = at - base;
        left.as_mapping_mut()?.bump_generation();

        let right = self.alloc_node(Node::mapping(at, end - at, flags, parent, right));
        self.activate(right)?;
        log::debug!(target: "vmar", "split [{:#x}, {:#x}) at {:#x}", base, end, at);
        Ok(right)
    }

    /// Splits `id` so that exactly `[base, end)` is one mapping and returns it.
    fn isolate(&mut self, id: NodeId, base: usize, end: usize) -> Result<NodeId, VmError> {
        let node = self.arena.live(id)?;
        let (node_base, node_end) = (node.base, node.end());
        if base < node_base || end > node_end || base >= end {
            return Err(VmError::InvalidArgs);
        }
        let target = if base > node_base { self.split_mapping(id, base)? } else { id };
        if end < node_end {
            self.split_mapping(target, end)?;
        }
        Ok(target)
    }

    /// Applies `prot` to `[base, end)` of mapping `id`. Capabilities are already checked.
    pub(super) fn protect_mapping_range(
        &mut self,
        id: NodeId,
        base: usize,
        end: usize,
        prot: MmuFlags,
    ) -> Result<(), VmError> {
        let target = self.isolate(id, base, end)?;
        let mapping = self.arena.live_mut(target)?.as_mapping_mut()?;
        mapping.arch_flags = prot;
        mapping.bump_generation();
        self.mmu.protect(base, end - base, prot)?;
        Ok(())
    }

    /// Removes `[base, end)` from mapping `id`, destroying the covered piece.
    pub(super) fn unmap_mapping_range(&mut self, id: NodeId, base: usize, end: usize) -> Result<(), VmError> {
        let target = self.isolate(id, base, end)?;
        self.teardown(target).into_result().map(|_| ())
    }
}

fn mapping_attribution(node: &Node, mapping: &MappingData) -> usize {
    let Some(object) = &mapping.object else {
        return 0;
    };
    let object_generation = object.generation();
    if let Some(cache) = mapping.attribution.get() {
        if cache.mapping_generation == mapping.generation && cache.object_generation == object_generation {
            return cache.pages;
        }
    }
    let pages = object.attributed_pages(mapping.object_offset, node.size);
    mapping.attribution.set(Some(AttributionCache {
        mapping_generation: mapping.generation,
        object_generation,
        pages,
    }));
    pages
}

