// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::maps;
use crate::pagemap;
use parking_lot::Mutex;
use portable_dma::Access;
use portable_dma::HostError;
use portable_dma::HostMemory;
use portable_dma::Origin;
use portable_dma::PinnedUnit;
use std::collections::HashMap;
use std::collections::HashSet;
use std::ffi::c_void;

#[derive(Debug, Default)]
struct PinState {
    // token -> page address
    pins: HashMap<u64, u64>,
    // mlock does not nest, so a page has one owner at a time.
    pages: HashSet<u64>,
    ranges: Vec<(u64, usize)>,
    next_token: u64,
}

/// Pins pages of the current process with `mlock`.
///
/// Access is validated against `/proc/self/maps` once per range, in
/// [`HostMemory::check_range`]. Each page has at most one pin.
#[derive(Debug)]
pub struct LockedHost {
    page_size: usize,
    state: Mutex<PinState>,
}

impl Default for LockedHost {
    fn default() -> Self {
        Self::new()
    }
}

fn mlock(address: u64, len: usize) -> Result<(), HostError> {
    // SAFETY: mlock does not access the memory; the kernel validates the
    // range.
    if unsafe { libc::mlock(address as *const c_void, len) } < 0 {
        return Err(HostError::Os(std::io::Error::last_os_error()));
    }
    Ok(())
}

fn munlock(address: u64, len: usize) -> Result<(), HostError> {
    // SAFETY: as for mlock.
    if unsafe { libc::munlock(address as *const c_void, len) } < 0 {
        return Err(HostError::Os(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Undoes the `mlock` of a pin that could not complete. The pin error is
/// what the caller sees, so an unlock failure is only logged.
fn unlock_after_failed_pin(address: u64, len: usize) {
    if let Err(err) = munlock(address, len) {
        tracing::warn!(
            error = &err as &dyn std::error::Error,
            address,
            "failed to unlock page after failed pin"
        );
    }
}

impl LockedHost {
    /// Creates a host using the system page size.
    pub fn new() -> Self {
        // SAFETY: sysconf has no safety requirements.
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        Self {
            page_size: usize::try_from(page_size).unwrap_or(4096),
            state: Mutex::new(PinState::default()),
        }
    }

    /// The number of pages currently pinned.
    pub fn pinned_count(&self) -> usize {
        self.state.lock().pins.len()
    }

    fn translate(&self, address: u64) -> Result<u64, HostError> {
        let page_mask = self.page_size as u64 - 1;
        let page = address & !page_mask;
        let pfn = pagemap::frames(page, 1, self.page_size)?[0];
        Ok(pfn * self.page_size as u64 + (address & page_mask))
    }
}

impl HostMemory for LockedHost {
    fn unit_size(&self) -> usize {
        self.page_size
    }

    fn check_range(
        &self,
        _origin: Origin,
        address: u64,
        len: usize,
        access: Access,
    ) -> Result<(), HostError> {
        maps::check(&maps::current()?, address, len as u64, access)
    }

    fn pin_unit(
        &self,
        _origin: Origin,
        unit_address: u64,
        _access: Access,
    ) -> Result<PinnedUnit, HostError> {
        let mut state = self.state.lock();
        if state.pages.contains(&unit_address) {
            return Err(HostError::AlreadyPinned {
                address: unit_address,
            });
        }
        mlock(unit_address, self.page_size).map_err(|err| match err {
            HostError::Os(err) if err.raw_os_error() == Some(libc::ENOMEM) => {
                HostError::NotPresent {
                    address: unit_address,
                }
            }
            err => err,
        })?;
        let physical_address = match self.translate(unit_address) {
            Ok(physical_address) => physical_address,
            Err(err) => {
                unlock_after_failed_pin(unit_address, self.page_size);
                return Err(err);
            }
        };
        state.pages.insert(unit_address);
        let token = state.next_token;
        state.next_token += 1;
        state.pins.insert(token, unit_address);
        Ok(PinnedUnit::new(unit_address, physical_address, token))
    }

    fn unpin_unit(&self, unit: PinnedUnit, _dirty: bool) -> Result<(), HostError> {
        let mut state = self.state.lock();
        let address = state.pins.remove(&unit.token()).ok_or(HostError::NotPinned {
            address: unit.address(),
        })?;
        state.pages.remove(&address);
        munlock(address, self.page_size)
    }

    fn physical_address(&self, _origin: Origin, address: u64) -> Result<u64, HostError> {
        self.translate(address)
    }

    fn lock_range(&self, address: u64, len: usize, access: Access) -> Result<(), HostError> {
        maps::check(&maps::current()?, address, len as u64, access)?;
        mlock(address, len)?;
        self.state.lock().ranges.push((address, len));
        tracing::debug!(address, len, "locked range");
        Ok(())
    }

    fn unlock_range(&self, address: u64, len: usize) -> Result<(), HostError> {
        let mut state = self.state.lock();
        let i = state
            .ranges
            .iter()
            .position(|&r| r == (address, len))
            .ok_or(HostError::NotPinned { address })?;
        state.ranges.swap_remove(i);
        munlock(address, len)
    }
}
