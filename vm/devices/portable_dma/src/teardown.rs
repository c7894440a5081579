// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Best-effort release of host resources.
//!
//! Nothing here returns an error. A host refusing to release something the
//! buffer believes it holds means an earlier step already released it, which
//! is a bug elsewhere; it is logged as [`InconsistentTeardown`] and the walk
//! continues with the next resource.

use crate::host::BusMapper;
use crate::host::HostError;
use crate::host::HostMemory;
use crate::mapper::BusMapping;
use crate::pin::FlatLock;
use crate::pin::Unit;
use thiserror::Error;

/// A resource marked as held was already gone when teardown reached it.
#[derive(Debug, Error)]
pub(crate) enum InconsistentTeardown {
    #[error("bus mapping at {bus_address:#x} was already released")]
    Unmap {
        bus_address: u64,
        #[source]
        source: HostError,
    },
    #[error("unit at {address:#x} was already unpinned")]
    Unpin {
        address: u64,
        #[source]
        source: HostError,
    },
    #[error("flat range at {address:#x} was already unlocked")]
    Unlock {
        address: u64,
        #[source]
        source: HostError,
    },
}

fn report(issue: InconsistentTeardown) {
    tracing::error!(
        error = &issue as &dyn std::error::Error,
        "inconsistent dma teardown"
    );
}

/// Unmaps `mappings` in reverse acquisition order.
pub(crate) fn unmap_all(bus: &dyn BusMapper, mappings: Vec<BusMapping>) {
    for mapping in mappings.into_iter().rev() {
        if let Err(source) = bus.unmap(mapping.bus_address, mapping.len, mapping.direction) {
            report(InconsistentTeardown::Unmap {
                bus_address: mapping.bus_address,
                source,
            });
        }
    }
}

/// Releases `units` in reverse acquisition order. Only really pinned units
/// go back to the host.
pub(crate) fn release_units(host: &dyn HostMemory, units: Vec<Unit>, dirty: bool) {
    for unit in units.into_iter().rev() {
        if let Unit::Pinned(unit) = unit {
            let address = unit.address();
            if let Err(source) = host.unpin_unit(unit, dirty) {
                report(InconsistentTeardown::Unpin { address, source });
            }
        }
    }
}

/// Releases a flat buffer lock.
pub(crate) fn unlock_flat(host: &dyn HostMemory, lock: FlatLock) {
    if let Err(source) = host.unlock_range(lock.address, lock.len) {
        report(InconsistentTeardown::Unlock {
            address: lock.address,
            source,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulated::EmulatedHost;
    use crate::emulated::Protection;
    use crate::host::Access;
    use crate::host::Origin;
    use crate::host::PinnedUnit;

    #[test]
    fn release_walks_past_stale_units() {
        let host = EmulatedHost::default();
        host.map_contiguous(Origin::CallerSpace, 0, 3, 0x10000, Protection::ReadWrite);
        let pin = |address| {
            Unit::Pinned(
                host.pin_unit(Origin::CallerSpace, address, Access::Read)
                    .unwrap(),
            )
        };
        let units = vec![
            pin(0),
            Unit::Pinned(PinnedUnit::new(0x1000, 0x11000, u64::MAX)),
            Unit::Resident {
                physical_address: 0x20000,
            },
            pin(0x2000),
        ];
        assert_eq!(host.pinned_count(), 2);
        release_units(&host, units, true);
        assert_eq!(host.pinned_count(), 0);
        assert!(host.is_dirty(Origin::CallerSpace, 0));
        assert!(host.is_dirty(Origin::CallerSpace, 0x2000));
        assert!(!host.is_dirty(Origin::CallerSpace, 0x1000));

        unlock_flat(
            &host,
            FlatLock {
                address: 0x1000,
                len: 0x10,
            },
        );
        assert_eq!(host.locked_range_count(), 0);
    }
}
