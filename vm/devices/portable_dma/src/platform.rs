// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Static capability table for the supported host kernel models.
//!
//! The two host models differ only in configuration: how buffers are
//! represented, the byte order of the device chain, the scheduler tick rate
//! and what an interrupt handler returns. None of this is decided at runtime;
//! each model maps to one fixed [`HostCapabilities`] entry.

/// A host kernel memory model.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum HostModel {
    /// Paged memory with scatter-gather lists and an IOMMU-capable DMA API.
    Paged,
    /// A flat, virtually contiguous buffer model where the host builds the
    /// physical chain from a user buffer and its size.
    Flat,
}

/// How a buffer descriptor holds on to its memory.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Representation {
    /// Individually pinned units.
    Scattered,
    /// One locked buffer plus size.
    Flat,
}

/// Byte order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Endianness {
    /// Least significant byte first.
    Little,
    /// Most significant byte first.
    Big,
}

impl Endianness {
    /// The byte order of the running CPU.
    pub const NATIVE: Self = if cfg!(target_endian = "big") {
        Endianness::Big
    } else {
        Endianness::Little
    };
}

/// What an interrupt handler returns on this host.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum IrqReturn {
    /// Handlers return a "handled" status value.
    Handled,
    /// Handlers return nothing.
    Void,
}

/// The configuration-only differences between host models.
#[derive(Debug, PartialEq, Eq)]
pub struct HostCapabilities {
    /// Buffer representation used by the pinning unit.
    pub representation: Representation,
    /// Byte order of the encoded device chain.
    pub chain_endianness: Endianness,
    /// Scheduler ticks per second.
    pub ticks_per_second: u32,
    /// Interrupt handler return convention.
    pub irq_return: IrqReturn,
    /// Number of significant bits in a bus address.
    pub bus_address_width: u32,
}

static PAGED: HostCapabilities = HostCapabilities {
    representation: Representation::Scattered,
    chain_endianness: Endianness::NATIVE,
    ticks_per_second: 250,
    irq_return: IrqReturn::Handled,
    bus_address_width: 64,
};

static FLAT: HostCapabilities = HostCapabilities {
    representation: Representation::Flat,
    chain_endianness: Endianness::Big,
    ticks_per_second: 100,
    irq_return: IrqReturn::Void,
    bus_address_width: 32,
};

impl HostModel {
    /// Returns the capability table entry for this model.
    pub const fn capabilities(self) -> &'static HostCapabilities {
        match self {
            HostModel::Paged => &PAGED,
            HostModel::Flat => &FLAT,
        }
    }
}

impl HostCapabilities {
    /// Converts milliseconds to scheduler ticks. Sub-tick delays round down
    /// to zero.
    pub fn ms_to_ticks(&self, ms: u64) -> u64 {
        // Multiply first; dividing first would return 0 for every delay
        // shorter than a second.
        ms.saturating_mul(self.ticks_per_second.into()) / 1000
    }

    /// Converts scheduler ticks to milliseconds.
    pub fn ticks_to_ms(&self, ticks: u64) -> u64 {
        ticks.saturating_mul(1000) / u64::from(self.ticks_per_second)
    }

    /// Returns whether the bus range `[bus_address, bus_address + len)` is
    /// addressable by a device on this host.
    pub fn bus_range_fits(&self, bus_address: u64, len: usize) -> bool {
        let Some(end) = bus_address.checked_add(len as u64) else {
            return false;
        };
        self.bus_address_width >= 64 || end <= 1 << self.bus_address_width
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_lookup() {
        let paged = HostModel::Paged.capabilities();
        assert_eq!(paged.representation, Representation::Scattered);
        assert_eq!(paged.irq_return, IrqReturn::Handled);

        let flat = HostModel::Flat.capabilities();
        assert_eq!(flat.representation, Representation::Flat);
        assert_eq!(flat.chain_endianness, Endianness::Big);
        assert_eq!(flat.irq_return, IrqReturn::Void);
    }

    #[test]
    fn tick_conversion_multiplies_first() {
        let caps = HostModel::Flat.capabilities();
        assert_eq!(caps.ms_to_ticks(5), 0);
        assert_eq!(caps.ms_to_ticks(10), 1);
        assert_eq!(caps.ms_to_ticks(1500), 150);
        assert_eq!(caps.ticks_to_ms(150), 1500);

        let caps = HostModel::Paged.capabilities();
        assert_eq!(caps.ms_to_ticks(1000), 250);
        assert_eq!(caps.ticks_to_ms(1), 4);
        assert_eq!(caps.ms_to_ticks(u64::MAX), u64::MAX / 1000);
    }

    #[test]
    fn bus_width() {
        let flat = HostModel::Flat.capabilities();
        assert!(flat.bus_range_fits(0xffff_f000, 0x1000));
        assert!(!flat.bus_range_fits(0xffff_f000, 0x1001));
        assert!(HostModel::Paged.capabilities().bus_range_fits(1 << 40, 0x1000));
        assert!(!HostModel::Paged.capabilities().bus_range_fits(u64::MAX, 2));
    }
}
