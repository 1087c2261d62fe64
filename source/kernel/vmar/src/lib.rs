// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Virtual memory address regions (VMARs) for NEURON address spaces
//! OWNERS: @kernel-mm-team
//! PUBLIC API: AddressSpace, AddressSpaceManager, VmarTree, RegionList, Placement, VmObject, ArchMmu
//! DEPENDS_ON: spin (address-space lock), bitflags, rand (ASLR draws), log, thiserror
//! INVARIANTS: Sibling ranges never overlap; children are contained in their parent;
//!             all structural mutation happens behind the address-space lock
//!
//! An address space is a tree. Interior nodes are *regions* that partition a span of
//! virtual addresses, leaves are *mappings* binding a range of a [`VmObject`] into the
//! span. The tree lives in an arena owned by [`VmarTree`]; callers hold [`NodeId`]
//! handles that go stale (and report [`LifeCycle::Dead`]) once the node is destroyed.
//!
//! The only way to obtain `&mut VmarTree` is [`AddressSpace::lock`], so every mutating
//! operation is statically tied to the address-space lock.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), forbid(clippy::unwrap_used))]

extern crate alloc;

pub mod aspace;
pub mod config;
pub mod error;
pub mod flags;
pub mod mmu;
pub mod object;
pub mod region_list;
pub mod types;
pub mod vmar;

pub use aspace::{AddressSpace, AddressSpaceError, AddressSpaceManager, AsHandle, AspaceGuard};
pub use config::{AslrConfig, AspaceConfig};
pub use error::{MapError, VmError};
pub use flags::{FaultFlags, MmuFlags, VmarFlags};
pub use mmu::{ArchMmu, PageTable, Translation};
pub use object::{PagedObject, VmObject};
pub use region_list::{Child, Gaps, RegionList};
pub use types::{LifeCycle, NodeId, PAGE_SHIFT, PAGE_SIZE};
pub use vmar::{
    MappingInfo, NodeInfo, Placement, RegionInfo, TeardownReport, TreeViolation, VmEnumerator,
    VmarTree,
};
