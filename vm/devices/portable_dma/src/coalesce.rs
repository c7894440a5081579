// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Merges pinned units into the fewest physically contiguous segments.

/// A physically contiguous piece of a buffer, no longer than the configured
/// segment cap.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Segment {
    /// The physical address of the first byte.
    pub address: u64,
    /// The length in bytes.
    pub len: u16,
}

/// Builds the segment list for `byte_length` bytes starting `byte_offset`
/// bytes into the first of `units`.
///
/// `units` holds the physical address of each `unit_size`-byte unit, in
/// virtual address order. Units whose physical addresses are exactly adjacent
/// are merged, and every merged run is then split into pieces of at most
/// `max_segment_len` bytes. The result is deterministic and its lengths sum
/// to `byte_length`.
///
/// # Panics
///
/// Panics if `max_segment_len` is zero or `units` does not cover the range.
pub fn coalesce(
    units: &[u64],
    unit_size: usize,
    byte_offset: usize,
    byte_length: usize,
    max_segment_len: u16,
) -> Vec<Segment> {
    assert!(byte_offset < unit_size || byte_length == 0);

    let unit_size = unit_size as u64;
    let mut remaining = byte_length as u64;
    let mut segments = Vec::new();
    // (start, len) of the contiguous run being built.
    let mut run: Option<(u64, u64)> = None;

    for (i, &unit) in units.iter().enumerate() {
        if remaining == 0 {
            break;
        }
        let skip = if i == 0 { byte_offset as u64 } else { 0 };
        let start = unit + skip;
        let len = (unit_size - skip).min(remaining);
        match &mut run {
            Some((run_start, run_len)) if *run_start + *run_len == start => *run_len += len,
            _ => {
                if let Some((run_start, run_len)) = run.take() {
                    split_run(run_start, run_len, max_segment_len, &mut segments);
                }
                run = Some((start, len));
            }
        }
        remaining -= len;
    }
    assert_eq!(remaining, 0, "units do not cover the requested range");
    if let Some((run_start, run_len)) = run {
        split_run(run_start, run_len, max_segment_len, &mut segments);
    }
    segments
}

/// Splits one contiguous run into segments of at most `max_segment_len`
/// bytes, appending them to `segments`.
///
/// # Panics
///
/// Panics if `max_segment_len` is zero.
pub fn split_run(
    mut address: u64,
    mut len: u64,
    max_segment_len: u16,
    segments: &mut Vec<Segment>,
) {
    assert!(max_segment_len > 0);
    while len > 0 {
        let n = len.min(max_segment_len.into()) as u16;
        segments.push(Segment { address, len: n });
        address += u64::from(n);
        len -= u64::from(n);
    }
}

/// Returns true if every unit immediately follows the previous one in
/// physical memory.
pub fn is_contiguous(units: &[u64], unit_size: usize) -> bool {
    units
        .windows(2)
        .all(|w| w[0].checked_add(unit_size as u64) == Some(w[1]))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 4096;

    fn total(segments: &[Segment]) -> u64 {
        segments.iter().map(|s| u64::from(s.len)).sum()
    }

    #[test]
    fn adjacent_units_split_at_cap() {
        let units = [0x10_0000, 0x10_0000 + 100_000, 0x10_0000 + 200_000];
        let segments = coalesce(&units, 100_000, 0, 300_000, u16::MAX);
        let lens: Vec<_> = segments.iter().map(|s| s.len).collect();
        assert_eq!(lens, [65535, 65535, 65535, 65535, 37860]);
        assert_eq!(total(&segments), 300_000);
        assert_eq!(segments[0].address, 0x10_0000);
        assert_eq!(segments[4].address, 0x10_0000 + 4 * 65535);
    }

    #[test]
    fn gaps_start_new_segments() {
        let units = [0x1000, 0x2000, 0x9000, 0x3000];
        let segments = coalesce(&units, PAGE, 0, 4 * PAGE, u16::MAX);
        assert_eq!(
            segments,
            [
                Segment {
                    address: 0x1000,
                    len: 0x2000
                },
                Segment {
                    address: 0x9000,
                    len: 0x1000
                },
                Segment {
                    address: 0x3000,
                    len: 0x1000
                },
            ]
        );
    }

    #[test]
    fn unaligned_head_and_tail() {
        let units = [0x5000, 0x6000, 0x7000];
        let segments = coalesce(&units, PAGE, 0xf00, 0x1200, u16::MAX);
        assert_eq!(
            segments,
            [Segment {
                address: 0x5f00,
                len: 0x1200
            }]
        );

        let units = [0x5000, 0x8000];
        let segments = coalesce(&units, PAGE, 0xff0, 0x20, u16::MAX);
        assert_eq!(
            segments,
            [
                Segment {
                    address: 0x5ff0,
                    len: 0x10
                },
                Segment {
                    address: 0x8000,
                    len: 0x10
                },
            ]
        );
    }

    #[test]
    fn narrow_cap() {
        let units = [0x1000, 0x2000];
        let segments = coalesce(&units, PAGE, 0, 2 * PAGE, 0x1800);
        let lens: Vec<_> = segments.iter().map(|s| s.len).collect();
        assert_eq!(lens, [0x1800, 0x800]);
        assert_eq!(segments[1].address, 0x2800);
    }

    #[test]
    fn deterministic() {
        let units: Vec<u64> = (0..64)
            .map(|i| 0x100_0000 + (i / 3) * 0x10_000 + (i % 3) * 0x1000)
            .collect();
        let a = coalesce(&units, PAGE, 0x123, 60 * PAGE, u16::MAX);
        let b = coalesce(&units, PAGE, 0x123, 60 * PAGE, u16::MAX);
        assert_eq!(a, b);
        assert_eq!(total(&a), 60 * PAGE as u64);
        // Runs of three adjacent pages, 21 distinct runs touched.
        assert_eq!(a.len(), 21);
    }

    #[test]
    #[should_panic(expected = "units do not cover the requested range")]
    fn short_units() {
        coalesce(&[0x1000], PAGE, 0, PAGE + 1, u16::MAX);
    }

    #[test]
    fn contiguity() {
        assert!(is_contiguous(&[0x1000, 0x2000, 0x3000], PAGE));
        assert!(is_contiguous(&[0x1000], PAGE));
        assert!(!is_contiguous(&[0x1000, 0x3000], PAGE));
    }
}
