// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Address-space container (lock owner) and ASID-allocating manager
//! OWNERS: @kernel-mm-team
//! PUBLIC API: AddressSpace (lock/page_fault), AspaceGuard, AddressSpaceManager, AsHandle
//! DEPENDS_ON: vmar::VmarTree, spin::Mutex, mmu::ArchMmu
//! INVARIANTS: One lock per address space guards every structural change of its tree;
//!             ASID 0 stays reserved for kernel/global mappings; a destroyed space frees
//!             its ASID only after its tree is torn down

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::num::NonZeroU32;

use rand::RngCore;
use spin::{Mutex, MutexGuard};
use thiserror::Error;

use crate::config::AspaceConfig;
use crate::error::VmError;
use crate::flags::FaultFlags;
use crate::mmu::ArchMmu;
use crate::vmar::VmarTree;

/// Maximum ASIDs made available by the allocator.
const MAX_ASIDS: usize = 256;
const WORD_BITS: usize = u64::BITS as usize;
const BITMAP_WORDS: usize = MAX_ASIDS.div_ceil(WORD_BITS);

/// Exclusive access to a tree. Holding it is holding the address-space lock.
pub type AspaceGuard<'a> = MutexGuard<'a, VmarTree>;

/// Handle referencing a tracked address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AsHandle(NonZeroU32);

impl AsHandle {
    fn from_index(index: usize) -> Self {
        Self(NonZeroU32::MIN.saturating_add(index as u32))
    }

    fn index(self) -> usize {
        self.0.get() as usize - 1
    }

    /// Constructs a handle from a raw value provided by userspace.
    pub fn from_raw(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    pub fn to_raw(self) -> u32 {
        self.0.get()
    }
}

/// Errors reported while managing address spaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum AddressSpaceError {
    /// Provided handle was not recognised.
    #[error("unknown address-space handle")]
    InvalidHandle,
    /// No more ASIDs are available.
    #[error("address-space identifiers exhausted")]
    AsidExhausted,
    /// The region tree rejected the request.
    #[error(transparent)]
    Vm(#[from] VmError),
}

/// One address space: a region tree behind its lock.
pub struct AddressSpace {
    asid: u16,
    tree: Mutex<VmarTree>,
}

static_assertions::assert_impl_all!(AddressSpace: Send, Sync);

impl AddressSpace {
    /// Creates an address space laid out per `config`. Without `rng` placement is first fit.
    pub fn new(
        asid: u16,
        config: &AspaceConfig,
        mmu: Box<dyn ArchMmu>,
        rng: Option<Box<dyn RngCore + Send>>,
    ) -> Result<Self, VmError> {
        let tree = VmarTree::new(config, mmu, rng)?;
        log::debug!(target: "aspace", "asid {} [{:#x}, {:#x})", asid, config.base, config.base + config.size);
        Ok(Self { asid, tree: Mutex::new(tree) })
    }

    /// Returns the hardware ASID backing this address space.
    pub fn asid(&self) -> u16 {
        self.asid
    }

    /// Acquires the address-space lock.
    pub fn lock(&self) -> AspaceGuard<'_> {
        self.tree.lock()
    }

    /// Resolves a page fault under the lock.
    ///
    /// On [`VmError::ShouldWait`] the lock is already released when this returns; wait for
    /// the object to supply the page and call again.
    pub fn page_fault(&self, va: usize, flags: FaultFlags) -> Result<(), VmError> {
        self.tree.lock().page_fault(va, flags)
    }

    /// Tears down every region and mapping. The space stays usable only for queries.
    fn teardown(&self) -> Result<usize, VmError> {
        let mut tree = self.tree.lock();
        let root = tree.root();
        tree.destroy(root)
    }
}

/// Manages the collection of address spaces and allocates ASIDs.
pub struct AddressSpaceManager {
    spaces: Vec<Option<Arc<AddressSpace>>>,
    asids: AsidAllocator,
}

impl Default for AddressSpaceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSpaceManager {
    pub fn new() -> Self {
        Self { spaces: Vec::new(), asids: AsidAllocator::new() }
    }

    /// Allocates a fresh address space and returns its handle.
    pub fn create(
        &mut self,
        config: &AspaceConfig,
        mmu: Box<dyn ArchMmu>,
        rng: Option<Box<dyn RngCore + Send>>,
    ) -> Result<AsHandle, AddressSpaceError> {
        let asid = self.asids.allocate().ok_or(AddressSpaceError::AsidExhausted)?;
        let space = match AddressSpace::new(asid, config, mmu, rng) {
            Ok(space) => Arc::new(space),
            Err(err) => {
                self.asids.free(asid);
                return Err(err.into());
            }
        };
        if let Some(index) = self.spaces.iter().position(Option::is_none) {
            self.spaces[index] = Some(space);
            return Ok(AsHandle::from_index(index));
        }
        self.spaces.push(Some(space));
        Ok(AsHandle::from_index(self.spaces.len() - 1))
    }

    /// Returns the address space identified by `handle`.
    pub fn get(&self, handle: AsHandle) -> Result<Arc<AddressSpace>, AddressSpaceError> {
        self.spaces
            .get(handle.index())
            .and_then(|slot| slot.clone())
            .ok_or(AddressSpaceError::InvalidHandle)
    }

    /// Tears down the address space and releases its ASID and handle.
    ///
    /// Teardown is best effort: the handle and ASID are released even when removing
    /// translations failed, and the first failure is returned afterwards.
    pub fn destroy(&mut self, handle: AsHandle) -> Result<usize, AddressSpaceError> {
        let space = self
            .spaces
            .get_mut(handle.index())
            .and_then(Option::take)
            .ok_or(AddressSpaceError::InvalidHandle)?;
        let result = space.teardown();
        self.asids.free(space.asid());
        log::debug!(target: "aspace", "asid {} destroyed: {:?}", space.asid(), result);
        Ok(result?)
    }
}

struct AsidAllocator {
    bitmap: [u64; BITMAP_WORDS],
    next: usize,
}

impl AsidAllocator {
    const fn new() -> Self {
        let mut bitmap = [0u64; BITMAP_WORDS];
        // Reserve ASID 0 for the kernel/global mappings.
        bitmap[0] |= 1;
        Self { bitmap, next: 1 }
    }

    fn allocate(&mut self) -> Option<u16> {
        for _ in 0..MAX_ASIDS {
            let index = self.next % MAX_ASIDS;
            self.next = (index + 1) % MAX_ASIDS;
            let (word, bit) = (index / WORD_BITS, index % WORD_BITS);
            if self.bitmap[word] & (1 << bit) == 0 {
                self.bitmap[word] |= 1 << bit;
                return Some(index as u16);
            }
        }
        None
    }

    fn free(&mut self, asid: u16) {
        let index = asid as usize;
        if index != 0 && index < MAX_ASIDS {
            self.bitmap[index / WORD_BITS] &= !(1 << (index % WORD_BITS));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmu::PageTable;

    fn create(manager: &mut AddressSpaceManager) -> Result<AsHandle, AddressSpaceError> {
        manager.create(&AspaceConfig::default(), Box::new(PageTable::new()), None)
    }

    #[test]
    fn allocate_unique_asids() {
        let mut manager = AddressSpaceManager::new();
        let mut seen = alloc::collections::BTreeSet::new();
        for _ in 0..(MAX_ASIDS - 1) {
            let handle = create(&mut manager).expect("allocate");
            let asid = manager.get(handle).expect("live handle").asid();
            assert_ne!(asid, 0);
            assert!(seen.insert(asid));
        }
        assert_eq!(create(&mut manager).unwrap_err(), AddressSpaceError::AsidExhausted);
    }

    #[test]
    fn destroy_releases_asid_and_handle() {
        let mut manager = AddressSpaceManager::new();
        let handles: Vec<_> = (0..(MAX_ASIDS - 1)).map(|_| create(&mut manager).expect("allocate")).collect();
        let victim = handles[3];
        let asid = manager.get(victim).expect("live").asid();

        assert_eq!(manager.destroy(victim), Ok(1));
        assert_eq!(manager.get(victim).err(), Some(AddressSpaceError::InvalidHandle));
        assert_eq!(manager.destroy(victim), Err(AddressSpaceError::InvalidHandle));

        let reused = create(&mut manager).expect("asid freed");
        assert_eq!(reused, victim);
        assert_eq!(manager.get(reused).expect("live").asid(), asid);
    }

    #[test]
    fn invalid_config_does_not_leak_asid() {
        let mut manager = AddressSpaceManager::new();
        let bad = AspaceConfig::new(0x10, 0x1000);
        for _ in 0..(MAX_ASIDS * 2) {
            let err = manager.create(&bad, Box::new(PageTable::new()), None).unwrap_err();
            assert_eq!(err, AddressSpaceError::Vm(VmError::InvalidArgs));
        }
        assert!(create(&mut manager).is_ok());
    }

    #[test]
    fn raw_handles_round_trip() {
        assert_eq!(AsHandle::from_raw(0), None);
        let handle = AsHandle::from_index(4);
        assert_eq!(handle.to_raw(), 5);
        assert_eq!(AsHandle::from_raw(5), Some(handle));
    }
}
