// THEORY:
// The `WorkRange` splits the frame sequence into contiguous slices, one per endpoint.
// It is a pure computation from `(total, endpoints, rank)` alone, so ranges are never
// transmitted: every endpoint (and the collector, when it validates a peer) derives
// the same answer.
//
// Endpoint `r` gets `total / n` frames plus one more when `r < total % n`. Diffing
// frame `i` needs frame `i - 1`, so every endpoint except the first also reads the
// frame just before its slice. That single overlapping frame is what the boundary
// exchange ships between neighbors.

use serde::{Deserialize, Serialize};
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkRange {
    /// First frame this endpoint needs to read.
    pub read_start: usize,
    /// First frame this endpoint is responsible for.
    pub process_start: usize,
    /// One past the last frame this endpoint is responsible for.
    pub end: usize,
}

impl WorkRange {
    /// The range of endpoint `rank` out of `endpoints` over `total` frames.
    ///
    /// # Panics
    /// When `endpoints` is zero or `rank` is not below `endpoints`.
    pub fn for_endpoint(total: usize, endpoints: usize, rank: usize) -> Self {
        assert!(endpoints > 0, "a pass needs at least one endpoint");
        assert!(rank < endpoints, "rank {rank} out of {endpoints} endpoints");

        let base = total / endpoints;
        let remainder = total % endpoints;
        let process_start = rank * base + rank.min(remainder);
        let end = process_start + base + usize::from(rank < remainder);
        let read_start = if rank == 0 { process_start } else { process_start.saturating_sub(1) };

        Self {
            read_start,
            process_start,
            end,
        }
    }

    /// True when the endpoint owns no frames at all (more endpoints than frames).
    pub fn is_empty(&self) -> bool {
        self.process_start >= self.end
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.process_start)
    }

    /// Frames this endpoint loads, boundary frame included.
    pub fn reads(&self) -> Range<usize> {
        if self.is_empty() {
            self.end..self.end
        } else {
            self.read_start..self.end
        }
    }

    /// Indices of the diff frames this endpoint emits. Frame 0 has no predecessor,
    /// so it never has a diff.
    pub fn emitted(&self) -> Range<usize> {
        if self.is_empty() {
            self.end..self.end
        } else {
            self.process_start.max(1)..self.end
        }
    }

    /// The frame this endpoint must receive from its predecessor, if any.
    pub fn boundary_frame(&self) -> Option<usize> {
        (!self.is_empty() && self.read_start < self.process_start).then_some(self.read_start)
    }

    /// The frame this endpoint must ship to its successor, if the successor has work.
    pub fn handoff_frame(&self, successor: &WorkRange) -> Option<usize> {
        successor.boundary_frame().filter(|_| !self.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all(total: usize, endpoints: usize) -> Vec<WorkRange> {
        (0..endpoints)
            .map(|rank| WorkRange::for_endpoint(total, endpoints, rank))
            .collect()
    }

    #[test]
    fn hundred_frames_over_four_endpoints() {
        let ranges = all(100, 4);
        let expected = [(0, 0, 25), (24, 25, 50), (49, 50, 75), (74, 75, 100)];
        for (range, (read_start, process_start, end)) in ranges.iter().zip(expected) {
            assert_eq!(
                *range,
                WorkRange {
                    read_start,
                    process_start,
                    end
                }
            );
        }
        assert_eq!(ranges.iter().map(|r| r.emitted().len()).sum::<usize>(), 99);
    }

    #[test]
    fn remainder_goes_to_the_first_endpoints() {
        let lens: Vec<usize> = all(10, 4).iter().map(WorkRange::len).collect();
        assert_eq!(lens, vec![3, 3, 2, 2]);
    }

    #[test]
    fn emitted_ranges_cover_every_diff_exactly_once() {
        for total in 1..=40 {
            for endpoints in 1..=12 {
                let mut seen = vec![0u32; total];
                let mut next_process_start = 0;
                for (rank, range) in all(total, endpoints).iter().enumerate() {
                    assert_eq!(range.process_start, next_process_start, "gap at {total}/{endpoints}/{rank}");
                    next_process_start = range.end;
                    if rank > 0 {
                        assert_eq!(range.read_start, range.process_start - 1);
                    }
                    for index in range.emitted() {
                        seen[index] += 1;
                    }
                }
                assert_eq!(next_process_start, total);
                assert_eq!(seen[0], 0);
                assert!(seen[1..].iter().all(|&count| count == 1), "{total}/{endpoints}: {seen:?}");
            }
        }
    }

    #[test]
    fn boundary_frames_chain_between_neighbors() {
        let ranges = all(7, 3);
        assert_eq!(ranges[0].boundary_frame(), None);
        assert_eq!(ranges[0].handoff_frame(&ranges[1]), Some(2));
        assert_eq!(ranges[1].boundary_frame(), Some(2));
        assert_eq!(ranges[1].handoff_frame(&ranges[2]), Some(4));
        assert_eq!(ranges[2].boundary_frame(), Some(4));
    }

    #[test]
    fn surplus_endpoints_get_empty_ranges() {
        let ranges = all(2, 4);
        assert!(!ranges[1].is_empty());
        assert!(ranges[2].is_empty() && ranges[3].is_empty());
        assert_eq!(ranges[1].handoff_frame(&ranges[2]), None);
        assert_eq!(ranges[2].boundary_frame(), None);
        assert!(ranges[3].reads().is_empty());
        assert!(ranges[3].emitted().is_empty());
    }

    #[test]
    fn single_frame_has_nothing_to_diff() {
        let range = WorkRange::for_endpoint(1, 1, 0);
        assert_eq!(range.reads(), 0..1);
        assert!(range.emitted().is_empty());
    }
}
