// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use parking_lot::Mutex;
use portable_dma::BusMapper;
use portable_dma::Direction;
use portable_dma::HostError;
use std::sync::atomic::Ordering;
use std::sync::atomic::fence;

/// A bus mapper for hosts without an IOMMU. Bus addresses are physical
/// addresses.
#[derive(Debug, Default)]
pub struct IdentityMapper {
    mappings: Mutex<Vec<(u64, usize, Direction)>>,
}

impl IdentityMapper {
    /// Creates a mapper with no live mappings.
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of live mappings.
    pub fn mapping_count(&self) -> usize {
        self.mappings.lock().len()
    }
}

impl BusMapper for IdentityMapper {
    fn map(
        &self,
        physical_address: u64,
        len: usize,
        direction: Direction,
    ) -> Result<u64, HostError> {
        if direction == Direction::ToDevice {
            // CPU stores must be visible before the device is told to read.
            fence(Ordering::Release);
        }
        self.mappings
            .lock()
            .push((physical_address, len, direction));
        Ok(physical_address)
    }

    fn unmap(&self, bus_address: u64, len: usize, direction: Direction) -> Result<(), HostError> {
        let mut mappings = self.mappings.lock();
        let i = mappings
            .iter()
            .position(|&m| m == (bus_address, len, direction))
            .ok_or(HostError::NotMapped { bus_address })?;
        mappings.swap_remove(i);
        drop(mappings);
        if direction == Direction::FromDevice {
            fence(Ordering::Acquire);
        }
        Ok(())
    }
}
