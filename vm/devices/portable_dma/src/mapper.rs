// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The bus address mapper.
//!
//! Mappings are all-or-nothing: if any mapping call fails, every mapping made
//! earlier in the same call is released before the failure is reported.

use crate::chain::ChainEntry;
use crate::coalesce::Segment;
use crate::coalesce::split_run;
use crate::host::BusMapper;
use crate::host::Direction;
use crate::host::HostError;
use crate::platform::HostCapabilities;
use crate::teardown;

/// A live streaming mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BusMapping {
    pub bus_address: u64,
    pub len: usize,
    pub direction: Direction,
}

/// A failed mapping attempt. Nothing from the attempt is still mapped.
#[derive(Debug)]
pub(crate) struct MapFailure {
    pub segment: usize,
    pub source: HostError,
}

/// Maps one physically contiguous range, rejecting bus addresses the device
/// cannot reach.
fn map_one(
    bus: &dyn BusMapper,
    caps: &HostCapabilities,
    physical_address: u64,
    len: usize,
    direction: Direction,
) -> Result<BusMapping, HostError> {
    let bus_address = bus.map(physical_address, len, direction)?;
    let mapping = BusMapping {
        bus_address,
        len,
        direction,
    };
    if !caps.bus_range_fits(bus_address, len) {
        teardown::unmap_all(bus, vec![mapping]);
        return Err(HostError::TranslationFailed {
            address: physical_address,
        });
    }
    Ok(mapping)
}

/// Maps each segment with its own mapping call.
pub(crate) fn map_segments(
    bus: &dyn BusMapper,
    caps: &HostCapabilities,
    segments: &[Segment],
    direction: Direction,
) -> Result<(Vec<BusMapping>, Vec<ChainEntry>), MapFailure> {
    let mut mappings = Vec::with_capacity(segments.len());
    let mut entries = Vec::with_capacity(segments.len());
    for (i, segment) in segments.iter().enumerate() {
        match map_one(bus, caps, segment.address, segment.len.into(), direction) {
            Ok(mapping) => {
                entries.push(ChainEntry {
                    address: mapping.bus_address,
                    count: segment.len,
                });
                mappings.push(mapping);
            }
            Err(source) => {
                tracing::warn!(
                    segment = i,
                    mapped = mappings.len(),
                    "bus mapping failed, rolling back"
                );
                teardown::unmap_all(bus, mappings);
                return Err(MapFailure { segment: i, source });
            }
        }
    }
    Ok((mappings, entries))
}

/// Maps a physically contiguous region with a single mapping call, then
/// splits the resulting bus range by the segment cap.
pub(crate) fn map_contiguous(
    bus: &dyn BusMapper,
    caps: &HostCapabilities,
    physical_address: u64,
    len: usize,
    direction: Direction,
    max_segment_len: u16,
) -> Result<(BusMapping, Vec<ChainEntry>), MapFailure> {
    let mapping = map_one(bus, caps, physical_address, len, direction)
        .map_err(|source| MapFailure { segment: 0, source })?;
    let entries = bus_entries(mapping.bus_address, len, max_segment_len);
    Ok((mapping, entries))
}

/// Splits an already-mapped bus range into chain entries.
pub(crate) fn bus_entries(bus_address: u64, len: usize, max_segment_len: u16) -> Vec<ChainEntry> {
    let mut segments = Vec::new();
    split_run(bus_address, len as u64, max_segment_len, &mut segments);
    segments
        .into_iter()
        .map(|s| ChainEntry {
            address: s.address,
            count: s.len,
        })
        .collect()
}
