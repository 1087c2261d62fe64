// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Region tree of one address space (arena of regions and mappings)
//! OWNERS: @kernel-mm-team
//! PUBLIC API: VmarTree, Placement, NodeInfo/RegionInfo/MappingInfo, VmEnumerator, TreeViolation,
//!             TeardownReport
//! DEPENDS_ON: region_list::RegionList, mmu::ArchMmu, object::VmObject, rand::RngCore
//! INVARIANTS: Children of a region never overlap and lie within it; every live child is
//!             listed exactly once in its parent's RegionList under its current base;
//!             handles to destroyed nodes never resolve again
//!
//! Nodes live in an arena owned by the tree. Parents reference children through the
//! `RegionList` of their `RegionData`, children reference parents through `Node::parent`;
//! both are plain [`NodeId`] handles, so there are no ownership cycles. A slot is released
//! the moment its node is destroyed and its generation moves on, which is what makes
//! stale handles observe [`LifeCycle::Dead`].
//!
//! Methods taking `&mut self` are structural mutations. `&mut VmarTree` is only reachable
//! through [`AddressSpace::lock`](crate::AddressSpace::lock), so holding it *is* holding the
//! address-space lock.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::Cell;
use core::num::NonZeroU32;

use rand::RngCore;

use crate::config::{AslrConfig, AspaceConfig};
use crate::error::VmError;
use crate::flags::{MmuFlags, VmarFlags};
use crate::mmu::ArchMmu;
use crate::object::VmObject;
use crate::region_list::RegionList;
use crate::types::{LifeCycle, NodeId, MAX_NAME_LEN};

mod destroy;
mod enumerate;
mod mapping;
mod region;


pub use destroy::TeardownReport;
pub use enumerate::{TreeViolation, VmEnumerator};
pub use region::Placement;

/// Cached result of a page-attribution query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct AttributionCache {
    mapping_generation: u64,
    object_generation: u64,
    pages: usize,
}

pub(crate) struct RegionData {
    name: String,
    children: RegionList<NodeId>,
}

pub(crate) struct MappingData {
    /// `None` for reserved ranges that are resident in hardware without an object.
    object: Option<Arc<dyn VmObject>>,
    object_offset: usize,
    arch_flags: MmuFlags,
    generation: u64,
    attribution: Cell<Option<AttributionCache>>,
}

impl MappingData {
    fn new(object: Option<Arc<dyn VmObject>>, object_offset: usize, arch_flags: MmuFlags) -> Self {
        Self { object, object_offset, arch_flags, generation: 1, attribution: Cell::new(None) }
    }

    /// Records a change that can alter which object pages this mapping covers.
    fn bump_generation(&mut self) {
        self.generation += 1;
    }
}

pub(crate) enum NodeKind {
    Region(RegionData),
    Mapping(MappingData),
}

pub(crate) struct Node {
    base: usize,
    size: usize,
    flags: VmarFlags,
    parent: Option<NodeId>,
    state: LifeCycle,
    kind: NodeKind,
}

impl Node {
    fn region(base: usize, size: usize, flags: VmarFlags, parent: Option<NodeId>, name: &str) -> Self {
        let data = RegionData { name: bounded_name(name), children: RegionList::new() };
        Self { base, size, flags, parent, state: LifeCycle::NotReady, kind: NodeKind::Region(data) }
    }

    fn mapping(base: usize, size: usize, flags: VmarFlags, parent: NodeId, data: MappingData) -> Self {
        Self {
            base,
            size,
            flags,
            parent: Some(parent),
            state: LifeCycle::NotReady,
            kind: NodeKind::Mapping(data),
        }
    }

    #[inline]
    fn end(&self) -> usize {
        self.base + self.size
    }

    fn as_region(&self) -> Result<&RegionData, VmError> {
        match &self.kind {
            NodeKind::Region(region) => Ok(region),
            NodeKind::Mapping(_) => Err(VmError::InvalidArgs),
        }
    }

    fn as_region_mut(&mut self) -> Result<&mut RegionData, VmError> {
        match &mut self.kind {
            NodeKind::Region(region) => Ok(region),
            NodeKind::Mapping(_) => Err(VmError::InvalidArgs),
        }
    }

    fn as_mapping(&self) -> Result<&MappingData, VmError> {
        match &self.kind {
            NodeKind::Mapping(mapping) => Ok(mapping),
            NodeKind::Region(_) => Err(VmError::InvalidArgs),
        }
    }

    fn as_mapping_mut(&mut self) -> Result<&mut MappingData, VmError> {
        match &mut self.kind {
            NodeKind::Mapping(mapping) => Ok(mapping),
            NodeKind::Region(_) => Err(VmError::InvalidArgs),
        }
    }

    fn is_region(&self) -> bool {
        matches!(self.kind, NodeKind::Region(_))
    }
}

fn bounded_name(name: &str) -> String {
    let mut end = name.len().min(MAX_NAME_LEN);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    String::from(&name[..end])
}

struct Slot {
    generation: NonZeroU32,
    node: Option<Node>,
}

/// Storage for every node of one tree.
#[derive(Default)]
struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl Arena {
    fn insert(&mut self, node: Node) -> NodeId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.node = Some(node);
            return NodeId::new(index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot { generation: NonZeroU32::MIN, node: Some(node) });
        NodeId::new(index, NonZeroU32::MIN)
    }

    fn get(&self, id: NodeId) -> Option<&Node> {
        self.slots
            .get(id.index())
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.node.as_ref())
    }

    fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.slots
            .get_mut(id.index())
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.node.as_mut())
    }

    /// Resolves a handle to an alive node.
    fn live(&self, id: NodeId) -> Result<&Node, VmError> {
        self.get(id).filter(|node| node.state == LifeCycle::Alive).ok_or(VmError::BadState)
    }

    fn live_mut(&mut self, id: NodeId) -> Result<&mut Node, VmError> {
        self.get_mut(id).filter(|node| node.state == LifeCycle::Alive).ok_or(VmError::BadState)
    }

    fn occupied(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Releases the slot. The handle, and every copy of it, stops resolving.
    fn remove(&mut self, id: NodeId) -> Option<Node> {
        let slot = self.slots.get_mut(id.index()).filter(|slot| slot.generation == id.generation())?;
        let node = slot.node.take()?;
        slot.generation = slot.generation.checked_add(1).unwrap_or(NonZeroU32::MIN);
        self.free.push(id.index() as u32);
        Some(node)
    }
}

/// Snapshot of a region, handed to enumerators and returned by [`VmarTree::info`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionInfo<'a> {
    pub id: NodeId,
    pub base: usize,
    pub size: usize,
    pub flags: VmarFlags,
    pub name: &'a str,
    pub parent: Option<NodeId>,
    pub children: usize,
}

/// Snapshot of a mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MappingInfo {
    pub id: NodeId,
    pub base: usize,
    pub size: usize,
    pub flags: VmarFlags,
    pub arch_flags: MmuFlags,
    pub object_offset: usize,
    pub generation: u64,
    /// True for object-less ranges installed by `reserve_space`.
    pub reserved: bool,
    pub parent: NodeId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeInfo<'a> {
    Region(RegionInfo<'a>),
    Mapping(MappingInfo),
}

impl NodeInfo<'_> {
    pub fn base(&self) -> usize {
        match self {
            NodeInfo::Region(region) => region.base,
            NodeInfo::Mapping(mapping) => mapping.base,
        }
    }

    pub fn size(&self) -> usize {
        match self {
            NodeInfo::Region(region) => region.size,
            NodeInfo::Mapping(mapping) => mapping.size,
        }
    }

    pub fn flags(&self) -> VmarFlags {
        match self {
            NodeInfo::Region(region) => region.flags,
            NodeInfo::Mapping(mapping) => mapping.flags,
        }
    }

    pub fn as_mapping(&self) -> Option<&MappingInfo> {
        match self {
            NodeInfo::Mapping(mapping) => Some(mapping),
            NodeInfo::Region(_) => None,
        }
    }
}

fn snapshot(id: NodeId, node: &Node) -> NodeInfo<'_> {
    match &node.kind {
        NodeKind::Region(region) => NodeInfo::Region(RegionInfo {
            id,
            base: node.base,
            size: node.size,
            flags: node.flags,
            name: &region.name,
            parent: node.parent,
            children: region.children.len(),
        }),
        NodeKind::Mapping(mapping) => NodeInfo::Mapping(MappingInfo {
            id,
            base: node.base,
            size: node.size,
            flags: node.flags,
            arch_flags: mapping.arch_flags,
            object_offset: mapping.object_offset,
            generation: mapping.generation,
            reserved: mapping.object.is_none(),
            // Mappings are never roots.
            parent: node.parent.unwrap_or(id),
        }),
    }
}

/// Regions and mappings of one address space.
pub struct VmarTree {
    arena: Arena,
    root: NodeId,
    mmu: Box<dyn ArchMmu>,
    rng: Option<Box<dyn RngCore + Send>>,
    aslr: AslrConfig,
}

// Attribution caches use interior mutability; the tree is only shared through its lock.
static_assertions::assert_impl_all!(VmarTree: Send);
static_assertions::assert_not_impl_any!(VmarTree: Sync);

impl VmarTree {
    /// Builds a tree whose root region spans the configured range.
    ///
    /// Without `rng` every placement is first fit.
    pub fn new(
        config: &AspaceConfig,
        mmu: Box<dyn ArchMmu>,
        rng: Option<Box<dyn RngCore + Send>>,
    ) -> Result<Self, VmError> {
        config.validate()?;
        let mut arena = Arena::default();
        let flags = config.root_flags & VmarFlags::PERSISTENT;
        let mut root = Node::region(config.base, config.size, flags, None, "root");
        root.state = LifeCycle::Alive;
        let root = arena.insert(root);
        log::debug!(
            target: "vmar",
            "root region [{:#x}, {:#x}) aslr={}",
            config.base,
            config.base + config.size,
            rng.is_some()
        );
        Ok(Self { arena, root, mmu, rng, aslr: config.aslr })
    }

    /// Root region of the address space.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Lifecycle of `id`. Destroyed nodes, including ones whose slot was reused, are `Dead`.
    pub fn state(&self, id: NodeId) -> LifeCycle {
        self.arena.get(id).map_or(LifeCycle::Dead, |node| node.state)
    }

    /// Snapshot of an alive node.
    pub fn info(&self, id: NodeId) -> Result<NodeInfo<'_>, VmError> {
        self.arena.live(id).map(|node| snapshot(id, node))
    }

    /// Children of a region in address order.
    pub fn children(&self, region: NodeId) -> Result<Vec<NodeId>, VmError> {
        let region = self.arena.live(region)?.as_region()?;
        Ok(region.children.iter().map(|child| child.value).collect())
    }

    /// Direct child of `region` containing `addr`. Does not descend further.
    pub fn find_region(&self, region: NodeId, addr: usize) -> Result<Option<NodeId>, VmError> {
        let region = self.arena.live(region)?.as_region()?;
        Ok(region.children.find_region(addr).map(|child| child.value))
    }

    /// Mapping containing `va`, searching the whole tree.
    pub fn find_mapping(&self, va: usize) -> Option<NodeId> {
        let mut current = self.root;
        loop {
            let node = self.arena.live(current).ok()?;
            match &node.kind {
                NodeKind::Mapping(_) => return Some(current),
                NodeKind::Region(region) => {
                    if va < node.base || va >= node.end() {
                        return None;
                    }
                    current = region.children.find_region(va)?.value;
                }
            }
        }
    }

    /// Hardware translation layer, for inspection.
    pub fn mmu(&self) -> &dyn ArchMmu {
        &*self.mmu
    }

    /// Allocates a node in the `NotReady` state.
    fn alloc_node(&mut self, node: Node) -> NodeId {
        debug_assert_eq!(node.state, LifeCycle::NotReady);
        self.arena.insert(node)
    }

    /// Links a `NotReady` node into its parent and marks it alive.
    fn activate(&mut self, id: NodeId) -> Result<(), VmError> {
        let (base, size, parent) = {
            let node = self.arena.get(id).ok_or(VmError::BadState)?;
            if node.state != LifeCycle::NotReady {
                return Err(VmError::BadState);
            }
            (node.base, node.size, node.parent.ok_or(VmError::BadState)?)
        };
        let inserted = self
            .arena
            .live_mut(parent)
            .and_then(|node| node.as_region_mut())
            .and_then(|region| region.children.insert(base, size, id));
        if let Err(err) = inserted {
            // Never linked, nothing to undo.
            self.arena.remove(id);
            return Err(err);
        }
        if let Some(node) = self.arena.get_mut(id) {
            node.state = LifeCycle::Alive;
        }
        Ok(())
    }

    /// Re-checks tree invariants after a structural change.
    #[inline]
    fn debug_verify(&self, op: &str) {
        #[cfg(any(debug_assertions, feature = "debug_verify"))]
        {
            if let Err(err) = self.verify() {
                log::error!(target: "vmar", "VMAR-VERIFY: violation after {}: {}", op, err);
                debug_assert!(false, "region tree invariant violated after {op}");
            }
        }
        #[cfg(not(any(debug_assertions, feature = "debug_verify")))]
        let _ = op;
    }
}
