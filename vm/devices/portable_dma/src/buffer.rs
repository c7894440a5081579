// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The buffer descriptor and its lifecycle.

use crate::Error;
use crate::chain::ChainEntry;
use crate::chain::DmaChain;
use crate::coalesce::coalesce;
use crate::coalesce::is_contiguous;
use crate::config::ConfigError;
use crate::config::DmaConfig;
use crate::config::LogLevel;
use crate::host::BusMapper;
use crate::host::Direction;
use crate::host::HostMemory;
use crate::host::Origin;
use crate::mapper;
use crate::mapper::BusMapping;
use crate::pin;
use crate::pin::FlatLock;
use crate::pin::Unit;
use crate::pin::UnitSpan;
use crate::teardown;
use std::fmt;
use std::fmt::Debug;
use std::sync::Arc;

/// Lifecycle state of a [`DmaBuffer`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BufferState {
    /// No resources held.
    Empty,
    /// Units pinned, no bus mapping yet.
    Locked,
    /// Bus addresses assigned; the chain can be exported.
    Mapped,
    /// Bus mapping released, units still pinned.
    Unmapped,
}

/// A request to lock a range of memory for DMA.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LockRequest {
    /// Where the memory came from.
    pub origin: Origin,
    /// The first byte of the range.
    pub address: u64,
    /// The length of the range in bytes.
    pub len: usize,
    /// The transfer direction.
    pub direction: Direction,
}

/// Shared state for creating DMA buffers against one host and one device.
#[derive(Clone)]
pub struct DmaContext {
    host: Arc<dyn HostMemory>,
    bus: Arc<dyn BusMapper>,
    config: DmaConfig,
}

impl Debug for DmaContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaContext")
            .field("unit_size", &self.host.unit_size())
            .field("config", &self.config)
            .finish()
    }
}

impl DmaContext {
    /// Creates a context. `config` is validated against the host's unit size.
    pub fn new(
        host: Arc<dyn HostMemory>,
        bus: Arc<dyn BusMapper>,
        config: DmaConfig,
    ) -> Result<Self, ConfigError> {
        config.validate(host.unit_size())?;
        Ok(Self { host, bus, config })
    }

    /// The context configuration.
    pub fn config(&self) -> &DmaConfig {
        &self.config
    }

    /// Creates an empty buffer whose transfers go in `direction`.
    pub fn buffer(&self, direction: Direction) -> DmaBuffer {
        DmaBuffer {
            ctx: self.clone(),
            direction,
            state: BufferState::Empty,
            origin: None,
            byte_offset: 0,
            byte_length: 0,
            units: Vec::new(),
            flat: None,
            mappings: Vec::new(),
            bus_handle: None,
            overlay: false,
            segments: Vec::new(),
        }
    }

    /// Creates a buffer and locks `request` into it.
    pub fn lock(&self, request: LockRequest) -> Result<DmaBuffer, Error> {
        let mut buffer = self.buffer(request.direction);
        buffer.lock(request.origin, request.address, request.len)?;
        Ok(buffer)
    }

    /// Locks, maps and exports `request` in one call.
    ///
    /// On failure everything acquired along the way has been released.
    pub fn lock_chain(&self, request: LockRequest) -> Result<(DmaBuffer, DmaChain), Error> {
        let mut buffer = self.lock(request)?;
        if let Err(err) = buffer.map() {
            buffer.release();
            return Err(err);
        }
        let chain = buffer.export()?;
        Ok((buffer, chain))
    }

    /// Wraps a range another device already exposes at `bus_address`, for
    /// peer-to-peer transfers. The buffer starts out mapped; nothing is
    /// pinned or mapped on the host, so nothing is unpinned or unmapped on
    /// release.
    pub fn overlay(
        &self,
        bus_address: u64,
        len: usize,
        direction: Direction,
    ) -> Result<DmaBuffer, Error> {
        if len == 0 || !self.config.capabilities().bus_range_fits(bus_address, len) {
            return Err(Error::InvalidRange {
                address: bus_address,
                len,
            });
        }
        let mut buffer = self.buffer(direction);
        buffer.byte_length = len;
        buffer.overlay = true;
        buffer.segments = mapper::bus_entries(bus_address, len, self.config.max_segment_len());
        buffer.state = BufferState::Mapped;
        tracing::debug!(bus_address, len, ?direction, "overlay dma buffer");
        Ok(buffer)
    }

    /// Maps a single physically contiguous range outside of any buffer.
    pub fn map_single(
        &self,
        physical_address: u64,
        len: usize,
        direction: Direction,
    ) -> Result<SingleMapping, Error> {
        if len == 0 {
            return Err(Error::InvalidRange {
                address: physical_address,
                len,
            });
        }
        let (mapping, _) = mapper::map_contiguous(
            &*self.bus,
            self.config.capabilities(),
            physical_address,
            len,
            direction,
            self.config.max_segment_len(),
        )
        .map_err(|failure| Error::MapFault {
            segment: failure.segment,
            segment_count: 1,
            source: failure.source,
        })?;
        Ok(SingleMapping {
            bus: self.bus.clone(),
            mapping: Some(mapping),
        })
    }
}

/// A DMA buffer descriptor.
///
/// Owned by one driver for the lifetime of one transaction. Dropping the
/// buffer releases whatever it still holds.
pub struct DmaBuffer {
    ctx: DmaContext,
    direction: Direction,
    state: BufferState,
    origin: Option<Origin>,
    byte_offset: usize,
    byte_length: usize,
    // Resources actually acquired. Teardown walks these, not `state`.
    units: Vec<Unit>,
    flat: Option<FlatLock>,
    mappings: Vec<BusMapping>,
    bus_handle: Option<BusMapping>,
    overlay: bool,
    segments: Vec<ChainEntry>,
}

impl Debug for DmaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("state", &self.state)
            .field("direction", &self.direction)
            .field("origin", &self.origin)
            .field("byte_offset", &self.byte_offset)
            .field("byte_length", &self.byte_length)
            .field("units", &self.units.len())
            .field("segments", &self.segments.len())
            .finish()
    }
}

impl DmaBuffer {
    /// The lifecycle state.
    pub fn state(&self) -> BufferState {
        self.state
    }

    /// The transfer direction, fixed at creation.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Where the locked memory came from. `None` when empty and for overlay
    /// buffers.
    pub fn origin(&self) -> Option<Origin> {
        self.origin
    }

    /// Offset of the first byte within the first unit.
    pub fn byte_offset(&self) -> usize {
        self.byte_offset
    }

    /// Length of the locked range in bytes.
    pub fn byte_length(&self) -> usize {
        self.byte_length
    }

    /// Number of units held, pinned or bookkept.
    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    /// Physical addresses of the held units, in order.
    pub fn unit_addresses(&self) -> Vec<u64> {
        self.units.iter().map(Unit::physical_address).collect()
    }

    /// The mapped segments. Empty unless the buffer is mapped.
    pub fn segments(&self) -> &[ChainEntry] {
        &self.segments
    }

    /// Number of valid entries in [`Self::segments`].
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// The bus address of the single mapping covering a contiguous
    /// driver-space buffer, if that path was taken.
    pub fn bus_handle(&self) -> Option<u64> {
        self.bus_handle.as_ref().map(|m| m.bus_address)
    }

    /// Whether this buffer wraps a peer device's bus range.
    pub fn is_overlay(&self) -> bool {
        self.overlay
    }

    /// Pins `len` bytes at `address`.
    ///
    /// On failure nothing is left pinned and the buffer stays empty.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is not empty.
    pub fn lock(&mut self, origin: Origin, address: u64, len: usize) -> Result<(), Error> {
        assert_eq!(
            self.state,
            BufferState::Empty,
            "lock requires an empty buffer"
        );
        let host = &*self.ctx.host;
        let span = UnitSpan::new(address, len, host.unit_size())
            .ok_or(Error::InvalidRange { address, len })?;
        let locked = pin::lock(
            host,
            self.ctx.config.capabilities().representation,
            origin,
            &span,
            self.direction,
        )
        .map_err(|source| {
            tracing::warn!(
                address,
                len,
                ?origin,
                direction = ?self.direction,
                error = &source as &dyn std::error::Error,
                "failed to lock dma buffer"
            );
            Error::PinFault {
                origin,
                address,
                len,
                source,
            }
        })?;

        self.origin = Some(origin);
        self.byte_offset = span.byte_offset;
        self.byte_length = len;
        self.units = locked.units;
        self.flat = locked.flat;
        self.state = BufferState::Locked;
        tracing::debug!(
            address,
            len,
            ?origin,
            direction = ?self.direction,
            units = self.units.len(),
            "locked dma buffer"
        );
        Ok(())
    }

    /// Assigns bus addresses to the locked range.
    ///
    /// On failure no mapping from this call survives and the buffer stays
    /// locked.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is not locked.
    pub fn map(&mut self) -> Result<(), Error> {
        assert_eq!(
            self.state,
            BufferState::Locked,
            "map requires a locked buffer"
        );
        let ctx = &self.ctx;
        let caps = ctx.config.capabilities();
        let max_segment_len = ctx.config.max_segment_len();
        let unit_size = ctx.host.unit_size();
        let physical = self.unit_addresses();

        let result = if self.origin == Some(Origin::DriverSpace)
            && is_contiguous(&physical, unit_size)
        {
            mapper::map_contiguous(
                &*ctx.bus,
                caps,
                physical[0] + self.byte_offset as u64,
                self.byte_length,
                self.direction,
                max_segment_len,
            )
            .map(|(handle, entries)| (Vec::new(), Some(handle), entries))
            .map_err(|failure| (failure, 1))
        } else {
            let segments = coalesce(
                &physical,
                unit_size,
                self.byte_offset,
                self.byte_length,
                max_segment_len,
            );
            let count = segments.len();
            mapper::map_segments(&*ctx.bus, caps, &segments, self.direction)
                .map(|(mappings, entries)| (mappings, None, entries))
                .map_err(|failure| (failure, count))
        };

        let (mappings, bus_handle, entries) = result.map_err(|(failure, segment_count)| {
            tracing::warn!(
                segment = failure.segment,
                segment_count,
                error = &failure.source as &dyn std::error::Error,
                "failed to map dma buffer"
            );
            Error::MapFault {
                segment: failure.segment,
                segment_count,
                source: failure.source,
            }
        })?;

        if ctx.config.log_level() >= LogLevel::SEGMENTS {
            for (i, entry) in entries.iter().enumerate() {
                tracing::trace!(
                    index = i,
                    bus_address = entry.address,
                    count = entry.count,
                    "dma segment"
                );
            }
        }
        tracing::debug!(
            segment_count = entries.len(),
            single = bus_handle.is_some(),
            "mapped dma buffer"
        );

        self.mappings = mappings;
        self.bus_handle = bus_handle;
        self.segments = entries;
        self.state = BufferState::Mapped;
        Ok(())
    }

    /// Returns a snapshot of the chain for the device.
    pub fn export(&self) -> Result<DmaChain, Error> {
        if self.state != BufferState::Mapped {
            return Err(Error::NotMapped { state: self.state });
        }
        Ok(DmaChain::new(self.segments.clone()))
    }

    /// Releases the bus mapping but keeps the units pinned.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is not mapped.
    pub fn unmap(&mut self) {
        assert_eq!(
            self.state,
            BufferState::Mapped,
            "unmap requires a mapped buffer"
        );
        self.unmap_inner();
        self.state = BufferState::Unmapped;
    }

    fn unmap_inner(&mut self) {
        let bus = &*self.ctx.bus;
        let mut mappings = std::mem::take(&mut self.mappings);
        mappings.extend(self.bus_handle.take());
        teardown::unmap_all(bus, mappings);
        self.segments.clear();
    }

    /// Releases everything the buffer holds and returns it to
    /// [`BufferState::Empty`].
    ///
    /// Never fails and is safe to call any number of times, in any state.
    /// Bus mappings go first, then pins, then the descriptor fields.
    pub fn release(&mut self) {
        if self.state == BufferState::Empty && !self.holds_resources() {
            return;
        }
        let prior = self.state;

        self.unmap_inner();

        let host = &*self.ctx.host;
        teardown::release_units(
            host,
            std::mem::take(&mut self.units),
            self.direction.dirties_memory(),
        );
        if let Some(lock) = self.flat.take() {
            teardown::unlock_flat(host, lock);
        }

        self.origin = None;
        self.byte_offset = 0;
        self.byte_length = 0;
        self.overlay = false;
        self.state = BufferState::Empty;
        tracing::debug!(?prior, "released dma buffer");
    }

    fn holds_resources(&self) -> bool {
        !self.units.is_empty()
            || self.flat.is_some()
            || !self.mappings.is_empty()
            || self.bus_handle.is_some()
            || !self.segments.is_empty()
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        self.release();
    }
}

/// A single streaming mapping made with [`DmaContext::map_single`].
///
/// Unmapped on drop if not unmapped explicitly.
pub struct SingleMapping {
    bus: Arc<dyn BusMapper>,
    mapping: Option<BusMapping>,
}

impl Debug for SingleMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleMapping")
            .field("mapping", &self.mapping)
            .finish()
    }
}

impl SingleMapping {
    /// The bus address the device must use.
    pub fn bus_address(&self) -> u64 {
        self.mapping.as_ref().map_or(0, |m| m.bus_address)
    }

    /// The mapped length in bytes.
    pub fn byte_length(&self) -> usize {
        self.mapping.as_ref().map_or(0, |m| m.len)
    }

    /// Releases the mapping.
    pub fn unmap(mut self) {
        self.unmap_inner();
    }

    fn unmap_inner(&mut self) {
        if let Some(mapping) = self.mapping.take() {
            teardown::unmap_all(&*self.bus, vec![mapping]);
        }
    }
}

impl Drop for SingleMapping {
    fn drop(&mut self) {
        self.unmap_inner();
    }
}
