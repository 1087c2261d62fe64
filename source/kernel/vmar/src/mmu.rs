// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Hardware translation interface consumed by the region tree
//! OWNERS: @kernel-mm-team
//! PUBLIC API: ArchMmu (map/unmap/protect/query), Translation, PageTable
//! DEPENDS_ON: flags::MmuFlags, error::MapError
//! INVARIANTS: Only page-aligned, Sv39-canonical translations are installed;
//!             protecting to an inaccessible mode removes translations
//!
//! `PageTable` is a software table keyed by virtual page. It stands in for the Sv39 walker
//! on the host and in selftests; the real walker implements the same trait.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::error::MapError;
use crate::flags::MmuFlags;
use crate::types::{is_page_aligned, range_end, PAGE_SIZE};

/// One installed translation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Translation {
    pub pa: usize,
    pub flags: MmuFlags,
}

/// Hardware translation layer of one address space.
///
/// Calls are synchronous. Errors are reported for resource exhaustion and malformed
/// requests only; the region tree passes them through unchanged.
pub trait ArchMmu: Send {
    /// Installs a single-page translation `va -> pa`.
    fn map(&mut self, va: usize, pa: usize, flags: MmuFlags) -> Result<(), MapError>;

    /// Removes every translation in `[va, va + len)`. Returns how many were removed.
    fn unmap(&mut self, va: usize, len: usize) -> Result<usize, MapError>;

    /// Changes the flags of every translation in `[va, va + len)`.
    fn protect(&mut self, va: usize, len: usize, flags: MmuFlags) -> Result<(), MapError>;

    /// Returns the translation installed for the page containing `va`.
    fn query(&self, va: usize) -> Option<Translation>;
}

/// Software translation table.
#[derive(Debug, Default)]
pub struct PageTable {
    entries: BTreeMap<usize, Translation>,
    max_entries: Option<usize>,
}

impl PageTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a table that refuses to hold more than `max_entries` translations.
    pub fn with_entry_limit(max_entries: usize) -> Self {
        Self { entries: BTreeMap::new(), max_entries: Some(max_entries) }
    }

    /// Number of installed translations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Installed translations inside `[va, va + len)`, in address order.
    pub fn translations(&self, va: usize, len: usize) -> Vec<(usize, Translation)> {
        let end = va.saturating_add(len);
        self.entries.range(va..end).map(|(va, t)| (*va, *t)).collect()
    }

    fn check_range(va: usize, len: usize) -> Result<usize, MapError> {
        if !is_page_aligned(va) || !is_page_aligned(len) {
            return Err(MapError::Unaligned);
        }
        let end = range_end(va, len).ok_or(MapError::OutOfRange)?;
        if len != 0 && (!is_canonical_sv39(va) || !is_canonical_sv39(end - 1)) {
            return Err(MapError::OutOfRange);
        }
        Ok(end)
    }
}

impl ArchMmu for PageTable {
    fn map(&mut self, va: usize, pa: usize, flags: MmuFlags) -> Result<(), MapError> {
        if !is_page_aligned(va) || !is_page_aligned(pa) {
            return Err(MapError::Unaligned);
        }
        if !is_canonical_sv39(va) {
            return Err(MapError::OutOfRange);
        }
        if !flags.is_accessible() {
            return Err(MapError::InvalidFlags);
        }
        if self.entries.contains_key(&va) {
            return Err(MapError::Overlap);
        }
        if self.max_entries.is_some_and(|max| self.entries.len() >= max) {
            return Err(MapError::NoMemory);
        }
        self.entries.insert(va, Translation { pa, flags });
        Ok(())
    }

    fn unmap(&mut self, va: usize, len: usize) -> Result<usize, MapError> {
        let end = Self::check_range(va, len)?;
        let doomed: Vec<usize> = self.entries.range(va..end).map(|(va, _)| *va).collect();
        for page in &doomed {
            self.entries.remove(page);
        }
        Ok(doomed.len())
    }

    fn protect(&mut self, va: usize, len: usize, flags: MmuFlags) -> Result<(), MapError> {
        let end = Self::check_range(va, len)?;
        if !flags.is_accessible() {
            return self.unmap(va, len).map(|_| ());
        }
        for (_, translation) in self.entries.range_mut(va..end) {
            translation.flags = flags;
        }
        Ok(())
    }

    fn query(&self, va: usize) -> Option<Translation> {
        self.entries.get(&(va & !(PAGE_SIZE - 1))).copied()
    }
}

/// True if `va` is a sign-extended 39-bit address.
pub fn is_canonical_sv39(va: usize) -> bool {
    let sign = (va >> 38) & 1;
    let upper = va >> 39;
    if sign == 0 {
        upper == 0
    } else {
        upper == usize::MAX >> 39
    }
}
