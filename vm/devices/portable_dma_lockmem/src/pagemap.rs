// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use portable_dma::HostError;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use zerocopy::IntoBytes;

const PRESENT: u64 = 1 << 63;
const PFN_MASK: u64 = 0x3f_ffff_ffff_ffff;

/// Returns the frame number of each of the `count` pages starting at the
/// page-aligned `address`.
pub(crate) fn frames(address: u64, count: usize, page_size: usize) -> Result<Vec<u64>, HostError> {
    let mut pagemap = fs_err::File::open("/proc/self/pagemap").map_err(HostError::Os)?;
    pagemap
        .seek(SeekFrom::Start(8 * (address / page_size as u64)))
        .map_err(HostError::Os)?;
    let mut pfns = vec![0u64; count];
    pagemap
        .read_exact(pfns.as_mut_bytes())
        .map_err(HostError::Os)?;
    for (i, pfn) in pfns.iter_mut().enumerate() {
        if *pfn & PRESENT == 0 {
            return Err(HostError::NotPresent {
                address: address + (i * page_size) as u64,
            });
        }
        *pfn &= PFN_MASK;
    }
    Ok(pfns)
}
