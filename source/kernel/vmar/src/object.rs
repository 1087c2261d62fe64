// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Memory-object interface consumed by leaf mappings
//! OWNERS: @kernel-mm-team
//! PUBLIC API: VmObject, PagedObject
//! DEPENDS_ON: spin::Mutex (object lock), flags::FaultFlags
//! INVARIANTS: The object lock is always taken after the address-space lock and never
//!             calls back into the region tree; the generation moves on every change
//!             visible to page attribution
//!
//! `PagedObject` is a minimal object used by selftests and host tests. Anonymous objects
//! zero-fill on demand. Pager-backed objects answer absent pages with
//! [`VmError::ShouldWait`] and record the request until [`PagedObject::supply`] fills it.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use crate::error::VmError;
use crate::flags::FaultFlags;
use crate::types::{is_page_aligned, range_end, PAGE_SHIFT, PAGE_SIZE};

/// Range of pages that can be bound into an address space.
pub trait VmObject: Send + Sync {
    /// Size in bytes.
    fn size(&self) -> usize;

    /// True if the object can change size after creation.
    fn is_resizable(&self) -> bool {
        false
    }

    /// Counter bumped on every resize or residency change.
    fn generation(&self) -> u64;

    /// Returns the physical address backing `offset`, populating it if needed.
    ///
    /// Returns [`VmError::ShouldWait`] when the page must be fetched out of line.
    fn get_page(&self, offset: usize, access: FaultFlags) -> Result<usize, VmError>;

    /// Returns the physical address backing `offset` if the page is resident.
    fn lookup_page(&self, offset: usize) -> Option<usize>;

    /// Number of resident pages in `[offset, offset + len)`.
    fn attributed_pages(&self, offset: usize, len: usize) -> usize;
}

/// Fake frame numbers handed out by `PagedObject`. Unique across objects.
static NEXT_FRAME: AtomicUsize = AtomicUsize::new(0x8000_0000);

fn alloc_frame() -> usize {
    NEXT_FRAME.fetch_add(PAGE_SIZE, Ordering::Relaxed)
}

struct ObjectState {
    size: usize,
    pages: BTreeMap<usize, usize>,
    pending: BTreeSet<usize>,
    generation: u64,
}

/// Simple paged memory object.
pub struct PagedObject {
    state: Mutex<ObjectState>,
    pager_backed: bool,
    resizable: bool,
    attribution_queries: AtomicUsize,
}

impl PagedObject {
    fn with_kind(size: usize, pager_backed: bool, resizable: bool) -> Self {
        Self {
            state: Mutex::new(ObjectState {
                size,
                pages: BTreeMap::new(),
                pending: BTreeSet::new(),
                generation: 1,
            }),
            pager_backed,
            resizable,
            attribution_queries: AtomicUsize::new(0),
        }
    }

    /// Anonymous object of `size` bytes, zero-filled on demand.
    pub fn new(size: usize) -> Self {
        Self::with_kind(size, false, false)
    }

    /// Anonymous object that may later be resized.
    pub fn resizable(size: usize) -> Self {
        Self::with_kind(size, false, true)
    }

    /// Object whose pages are supplied out of line.
    pub fn pager_backed(size: usize) -> Self {
        Self::with_kind(size, true, false)
    }

    /// Makes every page of `[offset, offset + len)` resident.
    pub fn commit(&self, offset: usize, len: usize) -> Result<(), VmError> {
        let mut state = self.state.lock();
        let end = checked_page_range(&state, offset, len)?;
        for page in (offset..end).step_by(PAGE_SIZE) {
            state.pages.entry(page >> PAGE_SHIFT).or_insert_with(alloc_frame);
            state.pending.remove(&(page >> PAGE_SHIFT));
        }
        state.generation += 1;
        Ok(())
    }

    /// Completes outstanding page requests in `[offset, offset + len)`. Returns how many
    /// requests were satisfied.
    pub fn supply(&self, offset: usize, len: usize) -> Result<usize, VmError> {
        let mut state = self.state.lock();
        let end = checked_page_range(&state, offset, len)?;
        let first = offset >> PAGE_SHIFT;
        let last = end >> PAGE_SHIFT;
        let ready: Vec<usize> = state.pending.range(first..last).copied().collect();
        for index in &ready {
            state.pending.remove(index);
            state.pages.entry(*index).or_insert_with(alloc_frame);
        }
        if !ready.is_empty() {
            state.generation += 1;
        }
        Ok(ready.len())
    }

    /// Drops resident pages in `[offset, offset + len)`.
    pub fn decommit(&self, offset: usize, len: usize) -> Result<(), VmError> {
        let mut state = self.state.lock();
        let end = checked_page_range(&state, offset, len)?;
        let first = offset >> PAGE_SHIFT;
        let last = end >> PAGE_SHIFT;
        state.pages.retain(|index, _| *index < first || *index >= last);
        state.generation += 1;
        Ok(())
    }

    /// Changes the size of a resizable object, dropping pages past the new end.
    pub fn resize(&self, size: usize) -> Result<(), VmError> {
        if !self.resizable {
            return Err(VmError::NotSupported);
        }
        if !is_page_aligned(size) {
            return Err(VmError::InvalidArgs);
        }
        let mut state = self.state.lock();
        let last = size >> PAGE_SHIFT;
        state.pages.retain(|index, _| *index < last);
        state.pending.retain(|index| *index < last);
        state.size = size;
        state.generation += 1;
        Ok(())
    }

    /// Offsets with an outstanding out-of-line request.
    pub fn pending_requests(&self) -> Vec<usize> {
        self.state.lock().pending.iter().map(|index| index << PAGE_SHIFT).collect()
    }

    /// How many times page attribution was computed.
    pub fn attribution_queries(&self) -> usize {
        self.attribution_queries.load(Ordering::Relaxed)
    }
}

fn checked_page_range(state: &ObjectState, offset: usize, len: usize) -> Result<usize, VmError> {
    if !is_page_aligned(offset) || !is_page_aligned(len) {
        return Err(VmError::InvalidArgs);
    }
    match range_end(offset, len) {
        Some(end) if end <= state.size => Ok(end),
        _ => Err(VmError::InvalidArgs),
    }
}

impl VmObject for PagedObject {
    fn size(&self) -> usize {
        self.state.lock().size
    }

    fn is_resizable(&self) -> bool {
        self.resizable
    }

    fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    fn get_page(&self, offset: usize, _access: FaultFlags) -> Result<usize, VmError> {
        let mut state = self.state.lock();
        if offset >= state.size {
            return Err(VmError::NotFound);
        }
        let index = offset >> PAGE_SHIFT;
        if let Some(pa) = state.pages.get(&index) {
            return Ok(*pa);
        }
        if self.pager_backed {
            state.pending.insert(index);
            return Err(VmError::ShouldWait);
        }
        let pa = alloc_frame();
        state.pages.insert(index, pa);
        state.generation += 1;
        Ok(pa)
    }

    fn lookup_page(&self, offset: usize) -> Option<usize> {
        self.state.lock().pages.get(&(offset >> PAGE_SHIFT)).copied()
    }

    fn attributed_pages(&self, offset: usize, len: usize) -> usize {
        self.attribution_queries.fetch_add(1, Ordering::Relaxed);
        let Some(end) = range_end(offset, len) else {
            return 0;
        };
        let first = offset >> PAGE_SHIFT;
        let last = end.div_ceil(PAGE_SIZE);
        self.state.lock().pages.range(first..last).count()
    }
}
