// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Capability interfaces to the host kernel's memory subsystem.
//!
//! The buffer manager never touches page tables or IOMMUs directly. Everything
//! it needs from the host is expressed by [`HostMemory`] (pinning and
//! physical address lookup) and [`BusMapper`] (streaming bus mappings).

use thiserror::Error;

/// Where the memory backing a buffer came from.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Origin {
    /// The calling process's address space. Units must be really pinned.
    CallerSpace,
    /// Memory allocated by the driver itself for DMA. Already resident, so
    /// pinning is bookkeeping only.
    DriverSpace,
}

/// The direction of a DMA transfer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Direction {
    /// The device reads memory.
    ToDevice,
    /// The device writes memory.
    FromDevice,
}

impl Direction {
    /// The CPU-side access the backing memory must permit for a transfer in
    /// this direction.
    pub fn required_access(self) -> Access {
        match self {
            Direction::ToDevice => Access::Read,
            Direction::FromDevice => Access::Write,
        }
    }

    /// Whether pages touched by this transfer must be marked dirty when they
    /// are unpinned.
    pub fn dirties_memory(self) -> bool {
        matches!(self, Direction::FromDevice)
    }
}

/// An access permission on a memory range.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Access {
    /// The range must be readable.
    Read,
    /// The range must be writable.
    Write,
}

/// A failure reported by a host capability.
#[derive(Debug, Error)]
pub enum HostError {
    /// The unit is not mapped or not resident.
    #[error("unit at {address:#x} is not present")]
    NotPresent {
        /// The faulting address.
        address: u64,
    },
    /// The unit is mapped without the required permission.
    #[error("{access:?} access denied at {address:#x}")]
    AccessDenied {
        /// The faulting address.
        address: u64,
        /// The permission that was required.
        access: Access,
    },
    /// The bus mapping table has no room left.
    #[error("bus mapping resources exhausted")]
    Exhausted,
    /// The address could not be translated.
    #[error("address translation failed for {address:#x}")]
    TranslationFailed {
        /// The untranslatable address.
        address: u64,
    },
    /// The unit is already pinned by another buffer.
    #[error("unit at {address:#x} is already pinned")]
    AlreadyPinned {
        /// The unit address.
        address: u64,
    },
    /// An unpin was requested for a unit that is not pinned.
    #[error("unit at {address:#x} is not pinned")]
    NotPinned {
        /// The unit address.
        address: u64,
    },
    /// An unmap was requested for a bus address that is not mapped.
    #[error("bus address {bus_address:#x} is not mapped")]
    NotMapped {
        /// The bus address.
        bus_address: u64,
    },
    /// The underlying OS call failed.
    #[error("host os error")]
    Os(#[source] std::io::Error),
}

/// A pinned unit of memory, exclusively owned by the buffer that pinned it.
///
/// This is deliberately neither `Clone` nor `Copy`: the only way to get rid
/// of one is to hand it back to [`HostMemory::unpin_unit`].
#[derive(Debug, PartialEq, Eq)]
pub struct PinnedUnit {
    address: u64,
    physical_address: u64,
    token: u64,
}

impl PinnedUnit {
    /// Creates a new pinned unit handle. Only host implementations should
    /// call this.
    ///
    /// `token` is opaque to the buffer manager and is returned to the host
    /// unchanged on unpin.
    pub fn new(address: u64, physical_address: u64, token: u64) -> Self {
        Self {
            address,
            physical_address,
            token,
        }
    }

    /// The unit-aligned virtual address that was pinned.
    pub fn address(&self) -> u64 {
        self.address
    }

    /// The physical address backing the unit.
    pub fn physical_address(&self) -> u64 {
        self.physical_address
    }

    /// The host's opaque token for this pin.
    pub fn token(&self) -> u64 {
        self.token
    }
}

/// Page pinning and physical address lookup.
pub trait HostMemory: Send + Sync {
    /// The pinning granularity in bytes. Must be a power of two.
    fn unit_size(&self) -> usize;

    /// Validates that every unit of `address..address + len` is present and
    /// permits `access`.
    ///
    /// Called once before the units of a range are pinned one by one. Hosts
    /// with an expensive per-unit check can do it here instead of in
    /// [`Self::pin_unit`].
    fn check_range(
        &self,
        _origin: Origin,
        _address: u64,
        _len: usize,
        _access: Access,
    ) -> Result<(), HostError> {
        Ok(())
    }

    /// Pins the unit at `unit_address` so that it cannot be evicted or
    /// relocated. This may block while the host faults the unit in.
    ///
    /// A unit has at most one pin at a time. Fails with
    /// [`HostError::AlreadyPinned`] if it is pinned already,
    /// [`HostError::NotPresent`] if it is not mapped, or
    /// [`HostError::AccessDenied`] if it does not permit `access`.
    fn pin_unit(
        &self,
        origin: Origin,
        unit_address: u64,
        access: Access,
    ) -> Result<PinnedUnit, HostError>;

    /// Releases a pin taken by [`Self::pin_unit`]. `dirty` is set when the
    /// device may have written the unit.
    fn unpin_unit(&self, unit: PinnedUnit, dirty: bool) -> Result<(), HostError>;

    /// Looks up the physical address of `address` without pinning it.
    fn physical_address(&self, origin: Origin, address: u64) -> Result<u64, HostError>;

    /// Locks a whole flat buffer in one call, validating `access` over the
    /// entire range.
    fn lock_range(&self, address: u64, len: usize, access: Access) -> Result<(), HostError>;

    /// Releases a lock taken by [`Self::lock_range`].
    fn unlock_range(&self, address: u64, len: usize) -> Result<(), HostError>;
}

/// Streaming bus mappings for a target device.
pub trait BusMapper: Send + Sync {
    /// Maps `len` bytes at `physical_address` for a transfer in `direction`,
    /// returning the bus address the device must use. Cache maintenance for
    /// `direction` happens here.
    fn map(
        &self,
        physical_address: u64,
        len: usize,
        direction: Direction,
    ) -> Result<u64, HostError>;

    /// Releases a mapping returned by [`Self::map`]. `direction` must match
    /// the one used to map.
    fn unmap(&self, bus_address: u64, len: usize, direction: Direction) -> Result<(), HostError>;
}
