// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Address-space layout and ASLR knobs
//! OWNERS: @kernel-mm-team
//! PUBLIC API: AspaceConfig, AslrConfig
//! INVARIANTS: A validated config describes a page-aligned, non-empty, non-overflowing span
//!
//! Defaults describe the Sv39 user half above the first 16 MiB, which stays unmapped to
//! catch null-pointer dereferences.

use crate::error::VmError;
use crate::flags::VmarFlags;
use crate::types::{is_page_aligned, range_end};

/// Default number of entropy bits for randomized placement.
pub const DEFAULT_ASLR_ENTROPY_BITS: u8 = 30;
/// Default number of entropy bits inside COMPACT regions.
pub const DEFAULT_COMPACT_ENTROPY_BITS: u8 = 8;
/// Largest entropy budget a draw can use.
pub const MAX_ENTROPY_BITS: u8 = 63;

const USER_ASPACE_BASE: usize = 0x0100_0000;
const USER_ASPACE_END: usize = 1 << 38;

/// Entropy budgets for randomized placement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AslrConfig {
    pub entropy_bits: u8,
    pub compact_entropy_bits: u8,
}

impl AslrConfig {
    pub const fn new(entropy_bits: u8, compact_entropy_bits: u8) -> Self {
        Self { entropy_bits, compact_entropy_bits }
    }

    #[inline]
    pub fn entropy_for(&self, compact: bool) -> u8 {
        if compact {
            self.compact_entropy_bits
        } else {
            self.entropy_bits
        }
    }
}

impl Default for AslrConfig {
    fn default() -> Self {
        Self::new(DEFAULT_ASLR_ENTROPY_BITS, DEFAULT_COMPACT_ENTROPY_BITS)
    }
}

/// Layout of one address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AspaceConfig {
    pub base: usize,
    pub size: usize,
    pub root_flags: VmarFlags,
    pub aslr: AslrConfig,
}

impl AspaceConfig {
    pub const fn new(base: usize, size: usize) -> Self {
        let aslr = AslrConfig::new(DEFAULT_ASLR_ENTROPY_BITS, DEFAULT_COMPACT_ENTROPY_BITS);
        Self { base, size, root_flags: VmarFlags::CAN_MAP_MASK, aslr }
    }

    pub fn with_root_flags(mut self, flags: VmarFlags) -> Self {
        self.root_flags = flags;
        self
    }

    pub fn with_aslr(mut self, aslr: AslrConfig) -> Self {
        self.aslr = aslr;
        self
    }

    /// Checks that the span is usable as a root region.
    pub fn validate(&self) -> Result<(), VmError> {
        if self.size == 0 || !is_page_aligned(self.base) || !is_page_aligned(self.size) {
            return Err(VmError::InvalidArgs);
        }
        if range_end(self.base, self.size).is_none() {
            return Err(VmError::InvalidArgs);
        }
        if self.aslr.entropy_bits > MAX_ENTROPY_BITS
            || self.aslr.compact_entropy_bits > MAX_ENTROPY_BITS
        {
            return Err(VmError::InvalidArgs);
        }
        Ok(())
    }
}

impl Default for AspaceConfig {
    fn default() -> Self {
        Self::new(USER_ASPACE_BASE, USER_ASPACE_END - USER_ASPACE_BASE)
    }
}
