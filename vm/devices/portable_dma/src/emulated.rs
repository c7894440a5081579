// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An in-memory host for tests and for running drivers without hardware.
//!
//! [`EmulatedHost`] keeps a page table per address space and tracks every
//! pin. [`EmulatedIommu`] hands out bus addresses from a fixed window and
//! logs the cache maintenance a real host would do. Both support fault
//! injection.

use crate::host::Access;
use crate::host::BusMapper;
use crate::host::Direction;
use crate::host::HostError;
use crate::host::HostMemory;
use crate::host::Origin;
use crate::host::PinnedUnit;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::collections::HashMap;

/// Page protection in an emulated address space.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Protection {
    /// Mapped but not accessible.
    None,
    /// Readable only.
    ReadOnly,
    /// Readable and writable.
    ReadWrite,
}

impl Protection {
    fn allows(self, access: Access) -> bool {
        match (self, access) {
            (Protection::ReadWrite, _) => true,
            (Protection::ReadOnly, Access::Read) => true,
            _ => false,
        }
    }
}

#[derive(Debug)]
struct PageEntry {
    physical_address: u64,
    protection: Protection,
    pinned: bool,
    dirty: bool,
}

#[derive(Debug, Default)]
struct HostState {
    caller: BTreeMap<u64, PageEntry>,
    driver: BTreeMap<u64, PageEntry>,
    // token -> (origin, unit address)
    pins: HashMap<u64, (Origin, u64)>,
    next_token: u64,
    flat_locks: Vec<(u64, usize)>,
    pin_calls: usize,
    range_checks: usize,
    fail_pin_at: Option<usize>,
}

impl HostState {
    fn table(&self, origin: Origin) -> &BTreeMap<u64, PageEntry> {
        match origin {
            Origin::CallerSpace => &self.caller,
            Origin::DriverSpace => &self.driver,
        }
    }

    fn table_mut(&mut self, origin: Origin) -> &mut BTreeMap<u64, PageEntry> {
        match origin {
            Origin::CallerSpace => &mut self.caller,
            Origin::DriverSpace => &mut self.driver,
        }
    }
}

/// An emulated host memory subsystem.
#[derive(Debug)]
pub struct EmulatedHost {
    unit_size: usize,
    state: Mutex<HostState>,
}

impl Default for EmulatedHost {
    fn default() -> Self {
        Self::new(4096)
    }
}

impl EmulatedHost {
    /// Creates a host with no mapped memory and the given pinning unit size.
    pub fn new(unit_size: usize) -> Self {
        Self {
            unit_size,
            state: Mutex::new(HostState::default()),
        }
    }

    fn unit_mask(&self) -> u64 {
        self.unit_size as u64 - 1
    }

    /// Maps one unit per entry of `physical`, starting at the unit-aligned
    /// `address`.
    pub fn map_units(
        &self,
        origin: Origin,
        address: u64,
        physical: &[u64],
        protection: Protection,
    ) {
        assert_eq!(address & self.unit_mask(), 0, "address must be unit aligned");
        let mut state = self.state.lock();
        let table = state.table_mut(origin);
        for (i, &physical_address) in physical.iter().enumerate() {
            table.insert(
                address + (i * self.unit_size) as u64,
                PageEntry {
                    physical_address,
                    protection,
                    pinned: false,
                    dirty: false,
                },
            );
        }
    }

    /// Maps `unit_count` physically contiguous units starting at
    /// `physical_address`.
    pub fn map_contiguous(
        &self,
        origin: Origin,
        address: u64,
        unit_count: usize,
        physical_address: u64,
        protection: Protection,
    ) {
        let physical: Vec<u64> = (0..unit_count)
            .map(|i| physical_address + (i * self.unit_size) as u64)
            .collect();
        self.map_units(origin, address, &physical, protection);
    }

    /// Makes the `index`th pin request from now fail with
    /// [`HostError::NotPresent`], once.
    pub fn fail_pin_at(&self, index: usize) {
        let mut state = self.state.lock();
        state.fail_pin_at = Some(state.pin_calls + index);
    }

    /// The number of units currently pinned.
    pub fn pinned_count(&self) -> usize {
        self.state.lock().pins.len()
    }

    /// The number of flat ranges currently locked.
    pub fn locked_range_count(&self) -> usize {
        self.state.lock().flat_locks.len()
    }

    /// Whether the unit containing `address` is currently pinned.
    pub fn is_pinned(&self, origin: Origin, address: u64) -> bool {
        let unit = address & !self.unit_mask();
        self.state
            .lock()
            .table(origin)
            .get(&unit)
            .is_some_and(|entry| entry.pinned)
    }

    /// The number of range checks made so far.
    pub fn range_checks(&self) -> usize {
        self.state.lock().range_checks
    }

    /// Whether the unit containing `address` was unpinned dirty.
    pub fn is_dirty(&self, origin: Origin, address: u64) -> bool {
        let unit = address & !self.unit_mask();
        self.state
            .lock()
            .table(origin)
            .get(&unit)
            .is_some_and(|entry| entry.dirty)
    }

    /// Drops every pin and flat lock behind the owners' backs, so their
    /// later release finds nothing to release.
    pub fn forget_pins(&self) {
        let mut state = self.state.lock();
        let state = &mut *state;
        state.pins.clear();
        state.flat_locks.clear();
        for entry in state.caller.values_mut().chain(state.driver.values_mut()) {
            entry.pinned = false;
        }
    }

    fn check_access(
        &self,
        state: &HostState,
        origin: Origin,
        address: u64,
        access: Access,
    ) -> Result<u64, HostError> {
        let unit = address & !self.unit_mask();
        let entry = state
            .table(origin)
            .get(&unit)
            .ok_or(HostError::NotPresent { address })?;
        if !entry.protection.allows(access) {
            return Err(HostError::AccessDenied { address, access });
        }
        Ok(entry.physical_address + (address - unit))
    }

    /// Checks every unit overlapping `address..address + len`. `report`
    /// picks the address checked, and named in the error, for each unit.
    fn check_units(
        &self,
        state: &HostState,
        origin: Origin,
        address: u64,
        len: usize,
        access: Access,
        report: impl Fn(u64) -> u64,
    ) -> Result<(), HostError> {
        let end = address
            .checked_add(len as u64)
            .ok_or(HostError::NotPresent { address })?;
        let mut unit = address & !self.unit_mask();
        while unit < end {
            self.check_access(state, origin, report(unit), access)?;
            unit += self.unit_size as u64;
        }
        Ok(())
    }
}

impl HostMemory for EmulatedHost {
    fn unit_size(&self) -> usize {
        self.unit_size
    }

    fn pin_unit(
        &self,
        origin: Origin,
        unit_address: u64,
        access: Access,
    ) -> Result<PinnedUnit, HostError> {
        let mut state = self.state.lock();
        let call = state.pin_calls;
        state.pin_calls += 1;
        if state.fail_pin_at == Some(call) {
            state.fail_pin_at = None;
            return Err(HostError::NotPresent {
                address: unit_address,
            });
        }
        let physical_address = self.check_access(&state, origin, unit_address, access)?;
        if let Some(entry) = state.table_mut(origin).get_mut(&unit_address) {
            if entry.pinned {
                return Err(HostError::AlreadyPinned {
                    address: unit_address,
                });
            }
            entry.pinned = true;
        }
        let token = state.next_token;
        state.next_token += 1;
        state.pins.insert(token, (origin, unit_address));
        Ok(PinnedUnit::new(unit_address, physical_address, token))
    }

    fn unpin_unit(&self, unit: PinnedUnit, dirty: bool) -> Result<(), HostError> {
        let mut state = self.state.lock();
        let (origin, address) = state
            .pins
            .remove(&unit.token())
            .ok_or(HostError::NotPinned {
                address: unit.address(),
            })?;
        if let Some(entry) = state.table_mut(origin).get_mut(&address) {
            entry.pinned = false;
            entry.dirty |= dirty;
        }
        Ok(())
    }

    fn physical_address(&self, origin: Origin, address: u64) -> Result<u64, HostError> {
        let unit = address & !self.unit_mask();
        let state = self.state.lock();
        let entry = state
            .table(origin)
            .get(&unit)
            .ok_or(HostError::NotPresent { address })?;
        Ok(entry.physical_address + (address - unit))
    }

    fn check_range(
        &self,
        origin: Origin,
        address: u64,
        len: usize,
        access: Access,
    ) -> Result<(), HostError> {
        let mut state = self.state.lock();
        state.range_checks += 1;
        self.check_units(&state, origin, address, len, access, |unit| unit)
    }

    fn lock_range(&self, address: u64, len: usize, access: Access) -> Result<(), HostError> {
        let mut state = self.state.lock();
        self.check_units(&state, Origin::CallerSpace, address, len, access, |unit| {
            unit.max(address)
        })?;
        state.flat_locks.push((address, len));
        Ok(())
    }

    fn unlock_range(&self, address: u64, len: usize) -> Result<(), HostError> {
        let mut state = self.state.lock();
        let i = state
            .flat_locks
            .iter()
            .position(|&lock| lock == (address, len))
            .ok_or(HostError::NotPinned { address })?;
        state.flat_locks.swap_remove(i);
        Ok(())
    }
}

/// A cache maintenance operation recorded by [`EmulatedIommu`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SyncOp {
    /// CPU caches written back before the device reads.
    Flush {
        /// The physical start of the range.
        physical_address: u64,
        /// The length of the range.
        len: usize,
    },
    /// CPU caches discarded after the device wrote.
    Invalidate {
        /// The physical start of the range.
        physical_address: u64,
        /// The length of the range.
        len: usize,
    },
}

const IOMMU_PAGE: u64 = 4096;

#[derive(Debug)]
struct IommuMapping {
    iova: u64,
    pages: u64,
    physical_address: u64,
    bus_address: u64,
    len: usize,
    direction: Direction,
}

#[derive(Debug)]
struct IommuState {
    // Sorted by iova.
    mappings: Vec<IommuMapping>,
    sync_log: Vec<SyncOp>,
    map_calls: usize,
    fail_map_at: Option<usize>,
}

/// An emulated IOMMU.
///
/// Bus addresses come from a window of `capacity` 4K pages at `base`, always
/// from the lowest free range that fits, so mapping the same layout again
/// after a full release reproduces the same bus addresses. In identity mode
/// the bus address is the physical address.
#[derive(Debug)]
pub struct EmulatedIommu {
    base: u64,
    capacity: u64,
    identity: bool,
    state: Mutex<IommuState>,
}

impl Default for EmulatedIommu {
    fn default() -> Self {
        Self::new(0x1000_0000, 0x10000)
    }
}

impl EmulatedIommu {
    /// Creates an IOMMU with a window of `capacity` pages at `base`.
    pub fn new(base: u64, capacity: u64) -> Self {
        Self {
            base,
            capacity,
            identity: false,
            state: Mutex::new(IommuState {
                mappings: Vec::new(),
                sync_log: Vec::new(),
                map_calls: 0,
                fail_map_at: None,
            }),
        }
    }

    /// Creates an IOMMU that maps every physical address to itself.
    pub fn identity() -> Self {
        Self {
            identity: true,
            ..Self::new(0, u64::MAX / IOMMU_PAGE)
        }
    }

    /// Makes the `index`th map request from now fail with
    /// [`HostError::Exhausted`], once.
    pub fn fail_map_at(&self, index: usize) {
        let mut state = self.state.lock();
        state.fail_map_at = Some(state.map_calls + index);
    }

    /// The number of live mappings.
    pub fn mapping_count(&self) -> usize {
        self.state.lock().mappings.len()
    }

    /// The total number of map calls made.
    pub fn map_calls(&self) -> usize {
        self.state.lock().map_calls
    }

    /// The cache maintenance performed so far.
    pub fn sync_log(&self) -> Vec<SyncOp> {
        self.state.lock().sync_log.clone()
    }

    /// Drops every mapping behind the owners' backs, so their later unmap
    /// finds nothing to unmap.
    pub fn forget_mappings(&self) {
        self.state.lock().mappings.clear();
    }

    /// Finds the lowest free iova range of `pages` pages.
    fn allocate(&self, mappings: &[IommuMapping], pages: u64) -> Option<(usize, u64)> {
        let mut next = 0;
        for (i, mapping) in mappings.iter().enumerate() {
            let start = (mapping.iova - self.base) / IOMMU_PAGE;
            if start - next >= pages {
                return Some((i, self.base + next * IOMMU_PAGE));
            }
            next = start + mapping.pages;
        }
        (self.capacity - next >= pages).then_some((mappings.len(), self.base + next * IOMMU_PAGE))
    }
}

impl BusMapper for EmulatedIommu {
    fn map(
        &self,
        physical_address: u64,
        len: usize,
        direction: Direction,
    ) -> Result<u64, HostError> {
        let mut state = self.state.lock();
        let call = state.map_calls;
        state.map_calls += 1;
        if state.fail_map_at == Some(call) {
            state.fail_map_at = None;
            return Err(HostError::Exhausted);
        }

        let page_offset = physical_address % IOMMU_PAGE;
        let pages = (page_offset + len as u64).div_ceil(IOMMU_PAGE);
        let (index, iova, bus_address) = if self.identity {
            let index = state
                .mappings
                .partition_point(|m| m.iova <= physical_address);
            (index, physical_address, physical_address)
        } else {
            let (index, iova) = self
                .allocate(&state.mappings, pages)
                .ok_or(HostError::Exhausted)?;
            (index, iova, iova + page_offset)
        };

        state.mappings.insert(
            index,
            IommuMapping {
                iova,
                pages,
                physical_address,
                bus_address,
                len,
                direction,
            },
        );
        if direction == Direction::ToDevice {
            state.sync_log.push(SyncOp::Flush {
                physical_address,
                len,
            });
        }
        Ok(bus_address)
    }

    fn unmap(&self, bus_address: u64, len: usize, direction: Direction) -> Result<(), HostError> {
        let mut state = self.state.lock();
        let i = state
            .mappings
            .iter()
            .position(|m| m.bus_address == bus_address && m.len == len && m.direction == direction)
            .ok_or(HostError::NotMapped { bus_address })?;
        let mapping = state.mappings.remove(i);
        if direction == Direction::FromDevice {
            state.sync_log.push(SyncOp::Invalidate {
                physical_address: mapping.physical_address,
                len,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_checks_protection() {
        let host = EmulatedHost::default();
        host.map_units(Origin::CallerSpace, 0x1000, &[0x8000], Protection::ReadOnly);
        let unit = host
            .pin_unit(Origin::CallerSpace, 0x1000, Access::Read)
            .unwrap();
        assert_eq!(unit.physical_address(), 0x8000);
        assert!(matches!(
            host.pin_unit(Origin::CallerSpace, 0x1000, Access::Write),
            Err(HostError::AccessDenied { .. })
        ));
        assert!(matches!(
            host.pin_unit(Origin::CallerSpace, 0x2000, Access::Read),
            Err(HostError::NotPresent { address: 0x2000 })
        ));
        assert_eq!(host.pinned_count(), 1);
        assert!(host.is_pinned(Origin::CallerSpace, 0x1800));
        host.unpin_unit(unit, true).unwrap();
        assert_eq!(host.pinned_count(), 0);
        assert!(!host.is_pinned(Origin::CallerSpace, 0x1800));
        assert!(host.is_dirty(Origin::CallerSpace, 0x1234));
    }

    #[test]
    fn pins_are_exclusive() {
        let host = EmulatedHost::default();
        host.map_units(Origin::CallerSpace, 0x1000, &[0x8000], Protection::ReadWrite);
        let unit = host
            .pin_unit(Origin::CallerSpace, 0x1000, Access::Write)
            .unwrap();
        assert!(matches!(
            host.pin_unit(Origin::CallerSpace, 0x1000, Access::Read),
            Err(HostError::AlreadyPinned { address: 0x1000 })
        ));
        assert_eq!(host.pinned_count(), 1);
        host.unpin_unit(unit, false).unwrap();
        let unit = host
            .pin_unit(Origin::CallerSpace, 0x1000, Access::Read)
            .unwrap();
        host.unpin_unit(unit, false).unwrap();
    }

    #[test]
    fn range_check_reports_first_bad_unit() {
        let host = EmulatedHost::default();
        host.map_contiguous(Origin::CallerSpace, 0, 2, 0x10000, Protection::ReadWrite);
        host.map_units(Origin::CallerSpace, 0x2000, &[0x20000], Protection::ReadOnly);
        host.check_range(Origin::CallerSpace, 0x10, 0x2ff0, Access::Read)
            .unwrap();
        assert!(matches!(
            host.check_range(Origin::CallerSpace, 0x10, 0x2ff0, Access::Write),
            Err(HostError::AccessDenied { address: 0x2000, .. })
        ));
        assert!(matches!(
            host.check_range(Origin::CallerSpace, 0, 0x4000, Access::Read),
            Err(HostError::NotPresent { address: 0x3000 })
        ));
        assert_eq!(host.range_checks(), 3);
        assert_eq!(host.pinned_count(), 0);
    }

    #[test]
    fn pin_fault_injection() {
        let host = EmulatedHost::default();
        host.map_contiguous(Origin::CallerSpace, 0, 4, 0x10000, Protection::ReadWrite);
        host.fail_pin_at(2);
        let a = host.pin_unit(Origin::CallerSpace, 0, Access::Read).unwrap();
        let b = host
            .pin_unit(Origin::CallerSpace, 0x1000, Access::Read)
            .unwrap();
        host.pin_unit(Origin::CallerSpace, 0x2000, Access::Read)
            .unwrap_err();
        let c = host
            .pin_unit(Origin::CallerSpace, 0x2000, Access::Read)
            .unwrap();
        for unit in [a, b, c] {
            host.unpin_unit(unit, false).unwrap();
        }
    }

    #[test]
    fn double_unpin_detected() {
        let host = EmulatedHost::default();
        host.map_units(Origin::CallerSpace, 0, &[0x5000], Protection::ReadWrite);
        let unit = host.pin_unit(Origin::CallerSpace, 0, Access::Write).unwrap();
        host.forget_pins();
        assert!(matches!(
            host.unpin_unit(unit, false),
            Err(HostError::NotPinned { address: 0 })
        ));
    }

    #[test]
    fn iova_first_fit() {
        let iommu = EmulatedIommu::new(0x10_0000, 16);
        let a = iommu.map(0x5000, 0x2000, Direction::ToDevice).unwrap();
        let b = iommu.map(0x9800, 0x1000, Direction::FromDevice).unwrap();
        assert_eq!(a, 0x10_0000);
        // Straddles a page boundary, so it takes two pages.
        assert_eq!(b, 0x10_2800);
        iommu.unmap(a, 0x2000, Direction::ToDevice).unwrap();
        let c = iommu.map(0x7000, 0x1000, Direction::ToDevice).unwrap();
        assert_eq!(c, 0x10_0000);
        assert!(matches!(
            iommu.map(0, 0xd000, Direction::ToDevice),
            Err(HostError::Exhausted)
        ));
        assert_eq!(iommu.mapping_count(), 2);
    }

    #[test]
    fn iommu_sync_log() {
        let iommu = EmulatedIommu::identity();
        let a = iommu.map(0x3000, 0x100, Direction::ToDevice).unwrap();
        let b = iommu.map(0x4000, 0x200, Direction::FromDevice).unwrap();
        assert_eq!((a, b), (0x3000, 0x4000));
        iommu.unmap(b, 0x200, Direction::FromDevice).unwrap();
        iommu.unmap(a, 0x100, Direction::ToDevice).unwrap();
        assert_eq!(
            iommu.sync_log(),
            [
                SyncOp::Flush {
                    physical_address: 0x3000,
                    len: 0x100
                },
                SyncOp::Invalidate {
                    physical_address: 0x4000,
                    len: 0x200
                },
            ]
        );
        assert!(matches!(
            iommu.unmap(a, 0x100, Direction::ToDevice),
            Err(HostError::NotMapped { bus_address: 0x3000 })
        ));
    }
}
