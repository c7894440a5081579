// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::pagemap;
use anyhow::Context;
use std::ffi::c_void;
use std::fs::File;
use std::os::unix::prelude::*;

/// Driver-owned memory suitable for [`Origin::DriverSpace`] buffers.
///
/// Backed by `memfd_secret` where the kernel supports it, since secret memory
/// is never swapped or migrated. Otherwise backed by a plain memfd that is
/// `mlock`ed for the lifetime of the mapping. Either way the frames recorded
/// at allocation stay valid until drop.
///
/// [`Origin::DriverSpace`]: portable_dma::Origin::DriverSpace
#[derive(Debug)]
pub struct DriverMemory {
    addr: *mut c_void,
    len: usize,
    secret: bool,
    locked: bool,
    pfns: Vec<u64>,
}

// SAFETY: The result of an mmap is safe to share amongst threads.
unsafe impl Send for DriverMemory {}
// SAFETY: The result of an mmap is safe to share amongst threads.
unsafe impl Sync for DriverMemory {}

fn secret_memfd() -> std::io::Result<File> {
    // SAFETY: memfd_secret takes only flags. The result is validated.
    let fd = unsafe { libc::syscall(libc::SYS_memfd_secret, libc::O_CLOEXEC as usize) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: fd is a new descriptor owned by nothing else.
    Ok(unsafe { File::from_raw_fd(fd as i32) })
}

fn shared_memfd() -> std::io::Result<File> {
    // SAFETY: The name is a valid nul-terminated string and the result is
    // validated.
    let fd = unsafe { libc::memfd_create(c"portable_dma".as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: fd is a new descriptor owned by nothing else.
    Ok(unsafe { File::from_raw_fd(fd) })
}

impl DriverMemory {
    /// Allocates `len` bytes. `len` must be a multiple of the page size.
    pub fn new(len: usize) -> anyhow::Result<Self> {
        // SAFETY: sysconf has no safety requirements.
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        if len == 0 || len % page_size != 0 {
            anyhow::bail!("not a page-size multiple");
        }

        let (file, secret) = match secret_memfd() {
            Ok(file) => (file, true),
            Err(err) => {
                tracing::debug!(
                    error = &err as &dyn std::error::Error,
                    "memfd_secret unavailable, using mlocked memfd"
                );
                (shared_memfd().context("failed to create memfd")?, false)
            }
        };
        file.set_len(len as u64)
            .context("failed to set memfd length")?;

        // SAFETY: No address is being passed. The result is being validated.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error()).context("failed to map memory");
        }
        let mut this = Self {
            addr,
            len,
            secret,
            locked: false,
            pfns: Vec::new(),
        };

        if !secret {
            // SAFETY: The range is the mapping created above.
            if unsafe { libc::mlock(addr, len) } < 0 {
                return Err(std::io::Error::last_os_error())
                    .context("failed to lock driver memory");
            }
            this.locked = true;
        }

        // Populate the PTEs by zeroing. MAP_POPULATE does not work for
        // memfd_secret mappings.
        //
        // SAFETY: The memory is valid for write.
        unsafe { addr.cast::<u8>().write_bytes(0, len) };

        this.pfns = pagemap::frames(this.address(), len / page_size, page_size)
            .context("failed to get pfns for driver memory")?;
        Ok(this)
    }

    /// Whether the memory is backed by `memfd_secret` rather than an
    /// `mlock`ed memfd.
    pub fn is_secret(&self) -> bool {
        self.secret
    }

    /// The virtual address of the first byte.
    pub fn address(&self) -> u64 {
        self.addr as u64
    }

    /// The length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false; zero-length allocations are rejected.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The frame number of each page.
    pub fn pfns(&self) -> &[u64] {
        &self.pfns
    }

    /// The memory as a byte slice.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: The mapping is valid for reads for its whole length until
        // drop.
        unsafe { std::slice::from_raw_parts(self.addr.cast(), self.len) }
    }
}

impl Drop for DriverMemory {
    fn drop(&mut self) {
        // SAFETY: self contains a valid mmap result, locked in new.
        if self.locked && unsafe { libc::munlock(self.addr, self.len) } < 0 {
            panic!("{:?}", std::io::Error::last_os_error());
        }
        // SAFETY: self contains a valid mmap result.
        if unsafe { libc::munmap(self.addr, self.len) } < 0 {
            panic!("{:?}", std::io::Error::last_os_error());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The `VmFlags` of the mapping starting at `address`, from smaps.
    fn vm_flags(address: u64) -> Option<String> {
        let smaps = fs_err::read_to_string("/proc/self/smaps").ok()?;
        let start = format!("{address:x}-");
        let mut lines = smaps.lines().skip_while(|line| !line.starts_with(&start));
        lines.next()?;
        lines
            .find_map(|line| line.strip_prefix("VmFlags:"))
            .map(str::to_owned)
    }

    #[test]
    fn driver_memory_is_held_in_place() {
        if fs_err::File::open("/proc/self/pagemap").is_err() {
            return;
        }
        // SAFETY: sysconf has no safety requirements.
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let mem = DriverMemory::new(2 * page_size).unwrap();
        assert_eq!(mem.locked, !mem.is_secret());
        if let Some(flags) = vm_flags(mem.address()) {
            assert!(flags.split_whitespace().any(|f| f == "lo"), "{flags}");
        }
        assert!(DriverMemory::new(page_size + 1).is_err());
    }
}
