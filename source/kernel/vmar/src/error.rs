// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Error kinds reported by the region tree and the translation layer
//! OWNERS: @kernel-mm-team
//! PUBLIC API: VmError, MapError
//! INVARIANTS: Translation errors pass through `VmError::Translation` unchanged;
//!             syscall handlers map kinds onto their own ABI status codes

use thiserror::Error;

/// Error returned by the hardware translation layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum MapError {
    /// Virtual or physical address was not page aligned.
    #[error("address is not page aligned")]
    Unaligned,
    /// Translation lies outside the range the hardware can address.
    #[error("address outside the translatable range")]
    OutOfRange,
    /// A translation is already installed at the address.
    #[error("translation already present")]
    Overlap,
    /// Flags do not describe a valid leaf entry.
    #[error("flags do not describe a valid translation")]
    InvalidFlags,
    /// The table cannot hold more entries.
    #[error("translation table exhausted")]
    NoMemory,
}

/// Error returned by region-tree operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum VmError {
    /// Bad size, alignment, offset or flags, or a range straddling a sub-region boundary.
    #[error("invalid arguments")]
    InvalidArgs,
    /// Requested capability was not granted by an ancestor region.
    #[error("capability not granted by the enclosing region")]
    NotSupported,
    /// Operation on a node that is not alive.
    #[error("node is not alive")]
    BadState,
    /// No placement satisfies the size, alignment and limit constraints.
    #[error("no placement satisfies the request")]
    NoMemory,
    /// No mapping covers the address or range.
    #[error("no mapping covers the range")]
    NotFound,
    /// Access is not allowed by the mapping's current protection.
    #[error("access denied by mapping protection")]
    AccessDenied,
    /// The backing object must fetch the page out of line; retry once it completes.
    #[error("page supply pending")]
    ShouldWait,
    /// Failure reported by the hardware translation layer.
    #[error("translation layer: {0}")]
    Translation(#[from] MapError),
}
