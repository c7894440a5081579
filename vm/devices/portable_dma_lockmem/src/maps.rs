// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Access checks against `/proc/self/maps`.

use portable_dma::Access;
use portable_dma::HostError;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct Region {
    pub start: u64,
    pub end: u64,
    pub readable: bool,
    pub writable: bool,
}

impl Region {
    fn allows(&self, access: Access) -> bool {
        match access {
            Access::Read => self.readable,
            Access::Write => self.writable,
        }
    }
}

/// Parses the text of a maps file. Malformed lines are skipped.
pub(crate) fn parse(text: &str) -> Vec<Region> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_ascii_whitespace();
            let (start, end) = fields.next()?.split_once('-')?;
            let perms = fields.next()?.as_bytes();
            Some(Region {
                start: u64::from_str_radix(start, 16).ok()?,
                end: u64::from_str_radix(end, 16).ok()?,
                readable: perms.first() == Some(&b'r'),
                writable: perms.get(1) == Some(&b'w'),
            })
        })
        .collect()
}

/// Checks that `[address, address + len)` is fully mapped with `access`.
pub(crate) fn check(
    regions: &[Region],
    address: u64,
    len: u64,
    access: Access,
) -> Result<(), HostError> {
    let end = address
        .checked_add(len)
        .ok_or(HostError::NotPresent { address })?;
    let mut cursor = address;
    while cursor < end {
        let region = regions
            .iter()
            .find(|r| r.start <= cursor && cursor < r.end)
            .ok_or(HostError::NotPresent { address: cursor })?;
        if !region.allows(access) {
            return Err(HostError::AccessDenied {
                address: cursor,
                access,
            });
        }
        cursor = region.end;
    }
    Ok(())
}

/// Reads and parses the current process's maps.
pub(crate) fn current() -> Result<Vec<Region>, HostError> {
    let text = fs_err::read_to_string("/proc/self/maps").map_err(HostError::Os)?;
    Ok(parse(&text))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
55d0c8a00000-55d0c8a02000 r--p 00000000 08:01 1234  /usr/bin/cat
55d0c8a02000-55d0c8a07000 r-xp 00002000 08:01 1234  /usr/bin/cat
55d0c9c3e000-55d0c9c5f000 rw-p 00000000 00:00 0     [heap]
7ffd1a2f0000-7ffd1a311000 rw-p 00000000 00:00 0     [stack]
7ffd1a3fe000-7ffd1a400000 ---p 00000000 00:00 0
garbage
";

    #[test]
    fn parse_sample() {
        let regions = parse(SAMPLE);
        assert_eq!(regions.len(), 5);
        assert_eq!(
            regions[2],
            Region {
                start: 0x55d0_c9c3_e000,
                end: 0x55d0_c9c5_f000,
                readable: true,
                writable: true,
            }
        );
        assert!(!regions[4].readable);
    }

    #[test]
    fn access_checks() {
        let regions = parse(SAMPLE);
        // Spans two adjacent read-only and read-exec regions.
        check(&regions, 0x55d0_c8a0_1000, 0x2000, Access::Read).unwrap();
        assert!(matches!(
            check(&regions, 0x55d0_c8a0_1000, 0x2000, Access::Write),
            Err(HostError::AccessDenied {
                address: 0x55d0_c8a0_1000,
                access: Access::Write
            })
        ));
        assert!(matches!(
            check(&regions, 0x55d0_c8a0_6000, 0x2000, Access::Read),
            Err(HostError::NotPresent {
                address: 0x55d0_c8a0_7000
            })
        ));
        assert!(matches!(
            check(&regions, 0x7ffd_1a3f_e000, 0x10, Access::Read),
            Err(HostError::AccessDenied { .. })
        ));
    }
}
