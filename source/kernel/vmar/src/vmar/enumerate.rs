// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Depth-first walks over the region tree (visitors, dump, invariant checks)
//! OWNERS: @kernel-mm-team
//! PUBLIC API: VmEnumerator, TreeViolation, VmarTree::{enumerate, dump, verify}
//! DEPENDS_ON: log (dump output)
//! INVARIANTS: Walks visit children in address order and never recurse on the call stack

use alloc::vec;
use alloc::vec::Vec;

use thiserror::Error;

use crate::error::VmError;
use crate::types::{LifeCycle, NodeId};

use super::{snapshot, MappingInfo, NodeInfo, NodeKind, RegionInfo, VmarTree};

/// Visitor driven by [`VmarTree::enumerate`]. Returning `false` stops the walk.
pub trait VmEnumerator {
    fn on_region(&mut self, region: &RegionInfo<'_>, depth: usize) -> bool;
    fn on_mapping(&mut self, mapping: &MappingInfo, depth: usize) -> bool;
}

/// Structural inconsistency found by [`VmarTree::verify`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum TreeViolation {
    #[error("child {child:?} of {parent:?} does not resolve to an alive node")]
    StaleChild { parent: NodeId, child: NodeId },
    #[error("child {child:?} is listed under a range it does not cover")]
    KeyMismatch { child: NodeId },
    #[error("child {child:?} does not point back at its parent")]
    ParentMismatch { child: NodeId },
    #[error("child {child:?} escapes its parent")]
    OutsideParent { child: NodeId },
    #[error("children {left:?} and {right:?} overlap")]
    Overlap { left: NodeId, right: NodeId },
    #[error("child {child:?} holds rights its parent lacks")]
    RightsEscalation { child: NodeId },
    #[error("{occupied} nodes allocated but {reachable} reachable from the root")]
    Orphans { occupied: usize, reachable: usize },
}

struct Dumper;

impl VmEnumerator for Dumper {
    fn on_region(&mut self, region: &RegionInfo<'_>, depth: usize) -> bool {
        log::info!(
            target: "vmar",
            "{:indent$}region '{}' [{:#x}, {:#x}) {:?} children={}",
            "",
            region.name,
            region.base,
            region.base + region.size,
            region.flags,
            region.children,
            indent = depth * 2
        );
        true
    }

    fn on_mapping(&mut self, mapping: &MappingInfo, depth: usize) -> bool {
        log::info!(
            target: "vmar",
            "{:indent$}mapping [{:#x}, {:#x}) offset={:#x} {:?} gen={}{}",
            "",
            mapping.base,
            mapping.base + mapping.size,
            mapping.object_offset,
            mapping.arch_flags,
            mapping.generation,
            if mapping.reserved { " reserved" } else { "" },
            indent = depth * 2
        );
        true
    }
}

impl VmarTree {
    /// Walks the subtree rooted at `from` depth first, children in address order.
    ///
    /// Returns `Ok(false)` if the visitor stopped the walk.
    pub fn enumerate(&self, from: NodeId, visitor: &mut dyn VmEnumerator) -> Result<bool, VmError> {
        self.arena.live(from)?;
        let mut worklist = vec![(from, 0usize)];
        while let Some((id, depth)) = worklist.pop() {
            let Some(node) = self.arena.get(id) else {
                continue;
            };
            let more = match snapshot(id, node) {
                NodeInfo::Region(region) => visitor.on_region(&region, depth),
                NodeInfo::Mapping(mapping) => visitor.on_mapping(&mapping, depth),
            };
            if !more {
                return Ok(false);
            }
            if let NodeKind::Region(region) = &node.kind {
                worklist.extend(region.children.iter().rev().map(|child| (child.value, depth + 1)));
            }
        }
        Ok(true)
    }

    /// Logs the whole tree at info level.
    pub fn dump(&self) {
        if self.enumerate(self.root, &mut Dumper).is_err() {
            log::info!(target: "vmar", "(root destroyed)");
        }
    }

    /// Checks containment, ordering, back-links and rights of every node.
    pub fn verify(&self) -> Result<(), TreeViolation> {
        if self.state(self.root) != LifeCycle::Alive {
            return Ok(());
        }
        let mut reachable = 1usize;
        let mut worklist: Vec<NodeId> = vec![self.root];
        while let Some(id) = worklist.pop() {
            let Some(node) = self.arena.get(id) else {
                continue;
            };
            let NodeKind::Region(region) = &node.kind else {
                continue;
            };
            let mut previous: Option<(NodeId, usize)> = None;
            for child in region.children.iter() {
                let entry = self
                    .arena
                    .get(child.value)
                    .filter(|entry| entry.state == LifeCycle::Alive)
                    .ok_or(TreeViolation::StaleChild { parent: id, child: child.value })?;
                if entry.base != child.base || entry.size != child.size {
                    return Err(TreeViolation::KeyMismatch { child: child.value });
                }
                if entry.parent != Some(id) {
                    return Err(TreeViolation::ParentMismatch { child: child.value });
                }
                if !child.within(node.base, node.end()) {
                    return Err(TreeViolation::OutsideParent { child: child.value });
                }
                if let Some((left, left_end)) = previous {
                    if child.base < left_end {
                        return Err(TreeViolation::Overlap { left, right: child.value });
                    }
                }
                if !node.flags.can_map().contains(entry.flags.can_map()) {
                    return Err(TreeViolation::RightsEscalation { child: child.value });
                }
                previous = Some((child.value, child.end()));
                reachable += 1;
                worklist.push(child.value);
            }
        }

        let occupied = self.arena.occupied();
        if occupied != reachable {
            return Err(TreeViolation::Orphans { occupied, reachable });
        }
        Ok(())
    }
}
