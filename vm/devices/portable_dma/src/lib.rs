// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A portable DMA buffer manager.
//!
//! A [`DmaBuffer`] takes a range of memory through its whole DMA lifetime:
//! pin the backing units, coalesce them into physically contiguous segments,
//! map those segments to bus addresses, hand the resulting [`DmaChain`] to a
//! device, and release everything again. The host kernel is reached only
//! through the [`HostMemory`] and [`BusMapper`] traits, so the same buffer
//! logic runs against a real kernel backend or the in-memory
//! [`emulated`] host.
//!
//! Acquisition is all-or-nothing at every step. A failed lock leaves nothing
//! pinned, a failed map leaves nothing mapped, and [`DmaBuffer::release`]
//! cannot fail.

#![forbid(unsafe_code)]

mod buffer;
pub mod chain;
pub mod coalesce;
mod config;
pub mod emulated;
mod host;
mod mapper;
mod pin;
pub mod platform;
mod teardown;

pub use buffer::BufferState;
pub use buffer::DmaBuffer;
pub use buffer::DmaContext;
pub use buffer::LockRequest;
pub use buffer::SingleMapping;
pub use chain::ChainEntry;
pub use chain::DmaChain;
pub use config::ConfigError;
pub use config::DmaConfig;
pub use config::LogLevel;
pub use host::Access;
pub use host::BusMapper;
pub use host::Direction;
pub use host::HostError;
pub use host::HostMemory;
pub use host::Origin;
pub use host::PinnedUnit;
pub use platform::HostModel;

use thiserror::Error;

/// A buffer operation failure.
#[derive(Debug, Error)]
pub enum Error {
    /// A unit of the range could not be pinned. Nothing is left pinned.
    #[error("failed to pin {len:#x} bytes at {address:#x} ({origin:?})")]
    PinFault {
        /// The origin of the range.
        origin: Origin,
        /// The start of the range.
        address: u64,
        /// The length of the range.
        len: usize,
        /// The host failure.
        #[source]
        source: HostError,
    },
    /// A segment could not be mapped. Nothing from the attempt is left
    /// mapped.
    #[error("failed to map segment {segment} of {segment_count}")]
    MapFault {
        /// Index of the failing segment.
        segment: usize,
        /// Number of segments the attempt needed.
        segment_count: usize,
        /// The host failure.
        #[source]
        source: HostError,
    },
    /// The chain was requested from a buffer that is not mapped.
    #[error("buffer is not mapped (state {state:?})")]
    NotMapped {
        /// The buffer state at the time of the request.
        state: BufferState,
    },
    /// The requested range is empty or wraps the address space.
    #[error("invalid range of {len:#x} bytes at {address:#x}")]
    InvalidRange {
        /// The start of the range.
        address: u64,
        /// The length of the range.
        len: usize,
    },
}

impl Error {
    /// Returns true if retrying the same operation later may succeed, because
    /// the failure was a resource shortage rather than a bad request.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::PinFault { source, .. } | Error::MapFault { source, .. } => {
                matches!(source, HostError::Exhausted)
            }
            Error::NotMapped { .. } | Error::InvalidRange { .. } => false,
        }
    }
}
