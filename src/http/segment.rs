//! Byte-range partitioning for segmented downloads.

use crate::record::{Segment, SegmentState};

/// Plans the segment partition for a download of `total` bytes.
///
/// `n = max(1, min(max_connections, total / min_segment_size))` segments
/// partition `[0, total)` contiguously; the last segment absorbs the
/// remainder.
#[must_use]
pub fn plan_segments(total: u64, max_connections: usize, min_segment_size: u64) -> Vec<Segment> {
    if total == 0 {
        return Vec::new();
    }
    let by_size = if min_segment_size == 0 { u64::MAX } else { total / min_segment_size };
    let count = (max_connections as u64).min(by_size).max(1);
    let base = total / count;

    let mut segments = Vec::with_capacity(count as usize);
    for index in 0..count {
        let start = index * base;
        let end = if index == count - 1 { total - 1 } else { (index + 1) * base - 1 };
        segments.push(Segment {
            index: index as u32,
            start,
            end,
            downloaded: 0,
            state: SegmentState::Pending,
        });
    }
    segments
}

/// Checks the partition invariants: contiguous, non-overlapping, covering
/// exactly `[0, total)`.
#[must_use]
pub fn is_valid_partition(segments: &[Segment], total: u64) -> bool {
    if total == 0 {
        return segments.is_empty();
    }
    let mut expected_start = 0u64;
    for (i, seg) in segments.iter().enumerate() {
        if seg.index as usize != i || seg.start != expected_start || seg.end < seg.start {
            return false;
        }
        expected_start = seg.end + 1;
    }
    expected_start == total
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_ten_mib_over_four_connections() {
        // 10 MiB with 4 connections and 1 MiB minimum: 4 segments of
        // 2_621_440 bytes.
        let segments = plan_segments(10 * MIB, 4, MIB);
        assert_eq!(segments.len(), 4);
        for seg in &segments {
            assert_eq!(seg.len(), 2_621_440);
        }
        assert_eq!(segments.iter().map(Segment::len).sum::<u64>(), 10 * MIB);
        assert!(is_valid_partition(&segments, 10 * MIB));
    }

    #[test]
    fn test_small_file_gets_one_segment() {
        let segments = plan_segments(100, 16, MIB);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].start, 0);
        assert_eq!(segments[0].end, 99);
        assert!(is_valid_partition(&segments, 100));
    }

    #[test]
    fn test_segment_count_bounded_by_connections() {
        let segments = plan_segments(100 * MIB, 16, MIB);
        assert_eq!(segments.len(), 16);
        assert!(is_valid_partition(&segments, 100 * MIB));
    }

    #[test]
    fn test_segment_count_bounded_by_min_size() {
        // 3 MiB / 1 MiB minimum allows at most 3 segments.
        let segments = plan_segments(3 * MIB, 16, MIB);
        assert_eq!(segments.len(), 3);
        assert!(is_valid_partition(&segments, 3 * MIB));
    }

    #[test]
    fn test_last_segment_absorbs_remainder() {
        let segments = plan_segments(10 * MIB + 7, 4, MIB);
        assert_eq!(segments.len(), 4);
        assert_eq!(segments.last().unwrap().end, 10 * MIB + 6);
        assert_eq!(segments.iter().map(Segment::len).sum::<u64>(), 10 * MIB + 7);
        assert!(is_valid_partition(&segments, 10 * MIB + 7));
    }

    #[test]
    fn test_zero_total_plans_nothing() {
        assert!(plan_segments(0, 4, MIB).is_empty());
    }

    #[test]
    fn test_partition_validator_catches_gaps_and_overlaps() {
        let mut segments = plan_segments(10 * MIB, 4, MIB);
        assert!(is_valid_partition(&segments, 10 * MIB));
        segments[2].start += 1;
        assert!(!is_valid_partition(&segments, 10 * MIB));
    }
}
