// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A Linux user-mode host for the portable DMA buffer manager.
//!
//! Units are pinned with `mlock`, validated against `/proc/self/maps` and
//! translated through `/proc/self/pagemap`. There is no IOMMU in user mode,
//! so [`IdentityMapper`] hands out physical addresses as bus addresses.
//! Reading real frame numbers from the pagemap needs `CAP_SYS_ADMIN`; without
//! it the kernel reports zero for every frame.

#![cfg(target_os = "linux")]
// UNSAFETY: mlock, mmap and raw memfd handling.
#![expect(unsafe_code)]

mod host;
mod maps;
mod mapper;
mod memory;
mod pagemap;

pub use host::LockedHost;
pub use mapper::IdentityMapper;
pub use memory::DriverMemory;

use portable_dma::DmaConfig;
use portable_dma::DmaContext;
use std::sync::Arc;

/// Builds a context over the current process using [`LockedHost`] and
/// [`IdentityMapper`].
pub fn context(config: DmaConfig) -> anyhow::Result<DmaContext> {
    let host = Arc::new(LockedHost::new());
    let bus = Arc::new(IdentityMapper::new());
    Ok(DmaContext::new(host, bus, config)?)
}
