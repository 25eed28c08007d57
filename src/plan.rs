//! Splitting the track sequence into duration-bounded parts.

use log::warn;

/// Default part ceiling: 12 hours.
pub const DEFAULT_MAX_PART_SECS: u64 = 43_200;

/// A contiguous, inclusive range of tracks destined for one output file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    /// 1-based sequence number.
    pub number: usize,
    pub start: usize,
    pub end: usize,
    /// Sum of member track durations in seconds.
    pub duration: u64,
}

impl Part {
    pub fn track_count(&self) -> usize {
        self.end - self.start + 1
    }

    /// Whether this part holds a single track longer than `max`.
    pub fn is_oversized(&self, max: u64) -> bool {
        self.duration > max
    }
}

struct Planner {
    parts: Vec<Part>,
    start: usize,
    sum: u64,
}

impl Planner {
    /// Emits tracks `start..end` as a part if any are pending.
    fn flush(&mut self, end: usize) {
        if end > self.start {
            self.parts.push(Part {
                number: self.parts.len() + 1,
                start: self.start,
                end: end - 1,
                duration: self.sum,
            });
        }
        self.start = end;
        self.sum = 0;
    }
}

/// Greedily packs `durations` (seconds, in playback order) into parts of at
/// most `max` seconds.
///
/// A single track longer than `max` gets a part of its own. Tracks are never
/// reordered and the planner never looks ahead.
pub fn plan_parts(durations: &[u64], max: u64) -> Vec<Part> {
    let mut planner = Planner {
        parts: Vec::new(),
        start: 0,
        sum: 0,
    };

    for (i, &duration) in durations.iter().enumerate() {
        if duration > max {
            planner.flush(i);
            warn!(
                "Track {} lasts {}s, longer than the {}s part limit; it gets a part of its own",
                i + 1,
                duration,
                max
            );
            planner.sum = duration;
            planner.flush(i + 1);
        } else if planner.sum + duration > max && planner.sum > 0 {
            planner.flush(i);
            planner.sum = duration;
        } else {
            planner.sum += duration;
        }
    }
    planner.flush(durations.len());
    planner.parts
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: u64 = 3_600;

    fn assert_partition(parts: &[Part], n: usize) {
        let mut next = 0;
        for (i, part) in parts.iter().enumerate() {
            assert_eq!(part.number, i + 1);
            assert_eq!(part.start, next);
            assert!(part.end >= part.start);
            next = part.end + 1;
        }
        assert_eq!(next, n);
    }

    #[test]
    fn short_book_is_one_part() {
        let durations = vec![312; 10];
        let parts = plan_parts(&durations, DEFAULT_MAX_PART_SECS);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].duration, 3_120);
        assert_partition(&parts, 10);
    }

    #[test]
    fn oversized_track_is_isolated() {
        let parts = plan_parts(&[13 * HOUR, HOUR, HOUR], 12 * HOUR);
        assert_eq!(parts.len(), 2);
        assert_eq!((parts[0].start, parts[0].end), (0, 0));
        assert!(parts[0].is_oversized(12 * HOUR));
        assert_eq!((parts[1].start, parts[1].end), (1, 2));
        assert_eq!(parts[1].duration, 2 * HOUR);
    }

    #[test]
    fn oversized_track_flushes_pending_part_first() {
        let parts = plan_parts(&[HOUR, 13 * HOUR, HOUR], 12 * HOUR);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].track_count(), 1);
        assert_eq!(parts[1].duration, 13 * HOUR);
        assert_eq!(parts[2].duration, HOUR);
        assert_partition(&parts, 3);
    }

    #[test]
    fn exact_limit_is_not_oversized() {
        let parts = plan_parts(&[10, 10, 5], 10);
        assert_eq!(parts.len(), 3);
        assert!(parts.iter().all(|p| p.duration <= 10));
        let parts = plan_parts(&[4, 6, 10], 10);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].duration, 10);
    }

    #[test]
    fn ceiling_and_partition_hold_for_many_shapes() {
        let max = 1_000;
        let mut seed: u64 = 0x9e37_79b9_7f4a_7c15;
        for n in 1..60 {
            let durations: Vec<u64> = (0..n)
                .map(|_| {
                    seed ^= seed << 13;
                    seed ^= seed >> 7;
                    seed ^= seed << 17;
                    1 + seed % 1_500
                })
                .collect();
            let parts = plan_parts(&durations, max);
            assert_partition(&parts, n);
            for part in &parts {
                let sum: u64 = durations[part.start..=part.end].iter().sum();
                assert_eq!(sum, part.duration);
                if part.duration > max {
                    assert_eq!(part.track_count(), 1);
                }
                for &d in &durations[part.start..=part.end] {
                    if d > max {
                        assert_eq!(part.track_count(), 1);
                    }
                }
            }
        }
    }

    #[test]
    fn empty_input_plans_nothing() {
        assert!(plan_parts(&[], 10).is_empty());
    }
}
