// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The device chain format.
//!
//! A chain is an ordered list of `(bus address, count)` pairs. The count is a
//! 16-bit field in every DMA engine this format serves, so no entry ever
//! describes more than [`MAX_SEGMENT_LEN`] bytes.

use crate::platform::Endianness;
use static_assertions::const_assert_eq;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// The largest byte count a single chain entry can encode.
pub const MAX_SEGMENT_LEN: u16 = u16::MAX;

/// One entry of a device chain.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ChainEntry {
    /// The bus address of the segment.
    pub address: u64,
    /// The segment length in bytes.
    pub count: u16,
}

/// A read-only snapshot of a mapped buffer's chain.
///
/// Changing a `DmaChain` never affects the buffer it was exported from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DmaChain {
    entries: Vec<ChainEntry>,
}

impl DmaChain {
    pub(crate) fn new(entries: Vec<ChainEntry>) -> Self {
        Self { entries }
    }

    /// The chain entries in transfer order.
    pub fn entries(&self) -> &[ChainEntry] {
        &self.entries
    }

    /// Mutable access to the entries, for drivers that patch the chain before
    /// handing it to hardware.
    pub fn entries_mut(&mut self) -> &mut [ChainEntry] {
        &mut self.entries
    }

    /// The number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the chain has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The total number of bytes described by the chain.
    pub fn total_len(&self) -> u64 {
        self.entries.iter().map(|e| u64::from(e.count)).sum()
    }

    /// Encodes the chain in the device wire format with the given byte
    /// order.
    pub fn encode(&self, endianness: Endianness) -> Vec<u8> {
        let records: Vec<ChainRecord> = self
            .entries
            .iter()
            .map(|entry| ChainRecord::new(entry, endianness))
            .collect();
        records.as_bytes().to_vec()
    }

    /// Decodes a chain from the device wire format. Returns `None` if `bytes`
    /// is not a whole number of records.
    pub fn decode(bytes: &[u8], endianness: Endianness) -> Option<Self> {
        let records = <[ChainRecord]>::ref_from_bytes(bytes).ok()?;
        Some(Self {
            entries: records.iter().map(|r| r.entry(endianness)).collect(),
        })
    }
}

impl IntoIterator for DmaChain {
    type Item = ChainEntry;
    type IntoIter = std::vec::IntoIter<ChainEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// The wire layout of one chain entry: an 8-byte bus address, a 2-byte count
/// and 6 reserved bytes.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct ChainRecord {
    address: [u8; 8],
    count: [u8; 2],
    reserved: [u8; 6],
}

const_assert_eq!(size_of::<ChainRecord>(), 16);

impl ChainRecord {
    fn new(entry: &ChainEntry, endianness: Endianness) -> Self {
        let (address, count) = match endianness {
            Endianness::Little => (entry.address.to_le_bytes(), entry.count.to_le_bytes()),
            Endianness::Big => (entry.address.to_be_bytes(), entry.count.to_be_bytes()),
        };
        Self {
            address,
            count,
            reserved: [0; 6],
        }
    }

    fn entry(&self, endianness: Endianness) -> ChainEntry {
        match endianness {
            Endianness::Little => ChainEntry {
                address: u64::from_le_bytes(self.address),
                count: u16::from_le_bytes(self.count),
            },
            Endianness::Big => ChainEntry {
                address: u64::from_be_bytes(self.address),
                count: u16::from_be_bytes(self.count),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DmaChain {
        DmaChain::new(vec![
            ChainEntry {
                address: 0x1_2345_6000,
                count: 0xffff,
            },
            ChainEntry {
                address: 0x8000,
                count: 0x10,
            },
        ])
    }

    #[test]
    fn wire_layout() {
        let bytes = sample().encode(Endianness::Big);
        assert_eq!(bytes.len(), 32);
        assert_eq!(&bytes[..10], &[0, 0, 0, 1, 0x23, 0x45, 0x60, 0, 0xff, 0xff]);
        assert_eq!(&bytes[10..16], &[0; 6]);

        let bytes = sample().encode(Endianness::Little);
        assert_eq!(&bytes[16..26], &[0, 0x80, 0, 0, 0, 0, 0, 0, 0x10, 0]);
    }

    #[test]
    fn decode_rejects_partial_record() {
        let bytes = sample().encode(Endianness::Little);
        assert_eq!(
            DmaChain::decode(&bytes, Endianness::Little).unwrap(),
            sample()
        );
        assert!(DmaChain::decode(&bytes[..20], Endianness::Little).is_none());
    }

    #[test]
    fn total() {
        assert_eq!(sample().total_len(), 0xffff + 0x10);
        assert!(DmaChain::default().is_empty());
    }
}
