// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Best-effort teardown of subtrees
//! OWNERS: @kernel-mm-team
//! PUBLIC API: TeardownReport, VmarTree::destroy
//! DEPENDS_ON: mmu::ArchMmu::unmap
//! INVARIANTS: Every node of the subtree is freed even when translation removal fails;
//!             children are freed before their parent; the first failure is kept

use alloc::vec;

use crate::error::VmError;
use crate::types::NodeId;

use super::{NodeKind, VmarTree};

/// Outcome of tearing down a subtree.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Nodes freed, the subtree root included.
    pub destroyed: usize,
    /// First translation-layer failure seen while unmapping.
    pub first_error: Option<VmError>,
}

impl TeardownReport {
    fn record(&mut self, err: VmError) {
        self.first_error.get_or_insert(err);
    }

    /// Number of destroyed nodes, or the first failure once everything is gone.
    pub fn into_result(self) -> Result<usize, VmError> {
        match self.first_error {
            Some(err) => Err(err),
            None => Ok(self.destroyed),
        }
    }
}

impl VmarTree {
    /// Destroys `node` and everything below it.
    ///
    /// Returns the number of destroyed nodes. Translation-removal failures do not stop the
    /// teardown; the first one is returned after the whole subtree is gone.
    pub fn destroy(&mut self, node: NodeId) -> Result<usize, VmError> {
        self.arena.live(node)?;
        let report = self.teardown(node);
        log::debug!(target: "vmar", "destroyed {} node(s)", report.destroyed);
        self.debug_verify("destroy");
        report.into_result()
    }

    /// Unlinks `node` from its parent and frees the subtree in post order.
    pub(super) fn teardown(&mut self, node: NodeId) -> TeardownReport {
        let mut report = TeardownReport::default();
        let Some((base, parent)) = self.arena.get(node).map(|n| (n.base, n.parent)) else {
            return report;
        };
        if let Some(parent) = parent.and_then(|parent| self.arena.get_mut(parent)) {
            if let NodeKind::Region(region) = &mut parent.kind {
                region.children.remove(base);
            }
        }

        // (node, children already queued)
        let mut worklist = vec![(node, false)];
        while let Some((id, expanded)) = worklist.pop() {
            let Some(current) = self.arena.get(id) else {
                continue;
            };
            if !expanded {
                if let NodeKind::Region(region) = &current.kind {
                    worklist.push((id, true));
                    worklist.extend(region.children.iter().rev().map(|child| (child.value, false)));
                    continue;
                }
            }

            let Some(dead) = self.arena.remove(id) else {
                continue;
            };
            if matches!(dead.kind, NodeKind::Mapping(_)) {
                if let Err(err) = self.mmu.unmap(dead.base, dead.size) {
                    log::warn!(
                        target: "vmar",
                        "teardown: unmap [{:#x}, {:#x}) failed: {}",
                        dead.base,
                        dead.end(),
                        err
                    );
                    report.record(err.into());
                }
            }
            report.destroyed += 1;
        }
        report
    }
}
