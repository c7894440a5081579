// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The page pinning unit.

use crate::host::Direction;
use crate::host::HostError;
use crate::host::HostMemory;
use crate::host::Origin;
use crate::host::PinnedUnit;
use crate::platform::Representation;
use crate::teardown;

/// One unit of a locked buffer.
#[derive(Debug)]
pub(crate) enum Unit {
    /// Really pinned; must be handed back to the host.
    Pinned(PinnedUnit),
    /// Driver-owned and already resident; bookkeeping only.
    Resident { physical_address: u64 },
}

impl Unit {
    pub fn physical_address(&self) -> u64 {
        match self {
            Unit::Pinned(unit) => unit.physical_address(),
            Unit::Resident { physical_address } => *physical_address,
        }
    }
}

/// A flat buffer lock taken with [`HostMemory::lock_range`].
#[derive(Debug)]
pub(crate) struct FlatLock {
    pub address: u64,
    pub len: usize,
}

/// The unit-granular extent of a byte range.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct UnitSpan {
    pub address: u64,
    pub len: usize,
    pub first_unit: u64,
    pub byte_offset: usize,
    pub unit_count: usize,
}

impl UnitSpan {
    /// Returns `None` for empty ranges and ranges that wrap the address
    /// space.
    pub fn new(address: u64, len: usize, unit_size: usize) -> Option<Self> {
        if len == 0 {
            return None;
        }
        let unit_mask = unit_size as u64 - 1;
        let end = address.checked_add(len as u64)?;
        let first_unit = address & !unit_mask;
        let last_unit = end.checked_add(unit_mask)? & !unit_mask;
        Some(Self {
            address,
            len,
            first_unit,
            byte_offset: (address - first_unit) as usize,
            unit_count: ((last_unit - first_unit) / unit_size as u64) as usize,
        })
    }

    fn unit_address(&self, index: usize, unit_size: usize) -> u64 {
        self.first_unit + (index * unit_size) as u64
    }
}

/// What a successful lock holds.
#[derive(Debug)]
pub(crate) struct LockedRange {
    pub units: Vec<Unit>,
    pub flat: Option<FlatLock>,
}

/// Pins every unit of `span`.
///
/// On failure nothing stays pinned or locked: units pinned before the
/// failing one are released before the error is returned.
pub(crate) fn lock(
    host: &dyn HostMemory,
    representation: Representation,
    origin: Origin,
    span: &UnitSpan,
    direction: Direction,
) -> Result<LockedRange, HostError> {
    let access = direction.required_access();
    match (representation, origin) {
        (Representation::Scattered, Origin::CallerSpace) => {
            let unit_size = host.unit_size();
            host.check_range(origin, span.first_unit, span.unit_count * unit_size, access)?;
            let mut units = Vec::with_capacity(span.unit_count);
            for i in 0..span.unit_count {
                match host.pin_unit(origin, span.unit_address(i, unit_size), access) {
                    Ok(unit) => units.push(Unit::Pinned(unit)),
                    Err(err) => {
                        tracing::warn!(
                            pinned = units.len(),
                            requested = span.unit_count,
                            "pin failed, releasing partial pin"
                        );
                        teardown::release_units(host, units, false);
                        return Err(err);
                    }
                }
            }
            Ok(LockedRange { units, flat: None })
        }
        (Representation::Flat, Origin::CallerSpace) => {
            host.lock_range(span.address, span.len, access)?;
            let lock = FlatLock {
                address: span.address,
                len: span.len,
            };
            match resident_units(host, origin, span) {
                Ok(units) => Ok(LockedRange {
                    units,
                    flat: Some(lock),
                }),
                Err(err) => {
                    teardown::unlock_flat(host, lock);
                    Err(err)
                }
            }
        }
        (_, Origin::DriverSpace) => Ok(LockedRange {
            units: resident_units(host, origin, span)?,
            flat: None,
        }),
    }
}

fn resident_units(
    host: &dyn HostMemory,
    origin: Origin,
    span: &UnitSpan,
) -> Result<Vec<Unit>, HostError> {
    let unit_size = host.unit_size();
    (0..span.unit_count)
        .map(|i| {
            host.physical_address(origin, span.unit_address(i, unit_size))
                .map(|physical_address| Unit::Resident { physical_address })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::UnitSpan;

    #[test]
    fn span_math() {
        let span = UnitSpan::new(0x1ff0, 0x20, 0x1000).unwrap();
        assert_eq!(span.first_unit, 0x1000);
        assert_eq!(span.byte_offset, 0xff0);
        assert_eq!(span.unit_count, 2);

        let span = UnitSpan::new(0x4000, 0x3000, 0x1000).unwrap();
        assert_eq!(span.byte_offset, 0);
        assert_eq!(span.unit_count, 3);

        let span = UnitSpan::new(0x4001, 1, 0x1000).unwrap();
        assert_eq!(span.unit_count, 1);
    }

    #[test]
    fn span_rejects_bad_ranges() {
        assert!(UnitSpan::new(0x1000, 0, 0x1000).is_none());
        assert!(UnitSpan::new(u64::MAX - 0x10, 0x20, 0x1000).is_none());
        assert!(UnitSpan::new(u64::MAX - 0x100, 0x10, 0x1000).is_none());
    }
}
