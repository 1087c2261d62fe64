// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Region capability flags, hardware protection flags and fault flags
//! OWNERS: @kernel-mm-team
//! PUBLIC API: VmarFlags, MmuFlags, FaultFlags
//! INVARIANTS: CAN_MAP_* of a child is always a subset of its parent's

use bitflags::bitflags;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    /// Creation and capability flags of regions and mappings.
    pub struct VmarFlags: u32 {
        const CAN_MAP_READ = 1 << 0;
        const CAN_MAP_WRITE = 1 << 1;
        const CAN_MAP_EXECUTE = 1 << 2;
        /// Children are placed with the compact entropy budget.
        const COMPACT = 1 << 3;
        /// Place at the supplied offset.
        const SPECIFIC = 1 << 4;
        /// Place at the supplied offset, replacing mappings already there.
        const SPECIFIC_OVERWRITE = 1 << 5;
        /// Refuse objects that can change size.
        const REQUIRE_NON_RESIZABLE = 1 << 6;
        /// The supplied offset bounds random placement from above.
        const OFFSET_IS_UPPER_LIMIT = 1 << 7;
        /// Install translations for resident pages right after mapping.
        const MAP_RANGE = 1 << 8;
    }
}

impl VmarFlags {
    pub const CAN_MAP_MASK: Self =
        Self::CAN_MAP_READ.union(Self::CAN_MAP_WRITE).union(Self::CAN_MAP_EXECUTE);

    /// Flags that describe the node itself rather than how it was placed.
    pub(crate) const PERSISTENT: Self = Self::CAN_MAP_MASK.union(Self::COMPACT);

    /// Flags only meaningful when creating a mapping.
    pub(crate) const MAPPING_ONLY: Self = Self::SPECIFIC_OVERWRITE
        .union(Self::REQUIRE_NON_RESIZABLE)
        .union(Self::MAP_RANGE);

    #[inline]
    pub fn can_map(self) -> Self {
        self & Self::CAN_MAP_MASK
    }

    /// Capabilities needed to install translations with `prot`.
    pub fn required_for(prot: MmuFlags) -> Self {
        let mut needed = Self::empty();
        needed.set(Self::CAN_MAP_READ, prot.contains(MmuFlags::READ));
        needed.set(Self::CAN_MAP_WRITE, prot.contains(MmuFlags::WRITE));
        needed.set(Self::CAN_MAP_EXECUTE, prot.contains(MmuFlags::EXECUTE));
        needed
    }

    /// True if these capabilities allow protection `prot`.
    #[inline]
    pub fn permits(self, prot: MmuFlags) -> bool {
        self.contains(Self::required_for(prot))
    }
}

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    /// Hardware protection of installed translations.
    pub struct MmuFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        const USER = 1 << 3;
        const GLOBAL = 1 << 4;
    }
}

impl MmuFlags {
    pub const PERMS: Self = Self::READ.union(Self::WRITE).union(Self::EXECUTE);

    #[inline]
    pub fn perms(self) -> Self {
        self & Self::PERMS
    }

    /// True if translations with these flags grant any access at all.
    #[inline]
    pub fn is_accessible(self) -> bool {
        self.intersects(Self::PERMS)
    }
}

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    /// Cause of a page fault. An empty set is a read fault.
    pub struct FaultFlags: u32 {
        const WRITE = 1 << 0;
        const EXECUTE = 1 << 1;
        const USER = 1 << 2;
        const NOT_PRESENT = 1 << 3;
    }
}

impl FaultFlags {
    /// Protection the faulting access needs.
    pub fn required_protection(self) -> MmuFlags {
        let mut prot = if self.contains(Self::WRITE) {
            MmuFlags::WRITE
        } else if self.contains(Self::EXECUTE) {
            MmuFlags::EXECUTE
        } else {
            MmuFlags::READ
        };
        if self.contains(Self::USER) {
            prot |= MmuFlags::USER;
        }
        prot
    }
}
