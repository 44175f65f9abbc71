//! Half-open satoshi ranges.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A contiguous half-open interval of satoshis, `[start, start + size)`.
///
/// Ranges are values: mutation is always "replace with new ranges".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    pub start: i64,
    pub size: i64,
}

impl Range {
    /// Sentinel returned by [`Range::intersect`] when two ranges do not overlap.
    pub const EMPTY: Range = Range { start: -1, size: 0 };

    pub const fn new(start: i64, size: i64) -> Self {
        Self { start, size }
    }

    /// Exclusive upper bound.
    pub const fn end(&self) -> i64 {
        self.start + self.size
    }

    /// Returns `true` for the no-intersection sentinel and for any
    /// zero-sized range.
    pub const fn is_empty(&self) -> bool {
        self.size <= 0
    }

    pub const fn contains(&self, sat: i64) -> bool {
        sat >= self.start && sat < self.end()
    }

    /// Returns `true` if the ranges share at least one sat.
    pub fn collides(&self, other: &Range) -> bool {
        !self.is_empty() && !other.is_empty() && self.start < other.end() && other.start < self.end()
    }

    /// Ordering under which overlapping ranges compare `Equal`.
    ///
    /// Only a total order over sets of pairwise disjoint ranges, which is
    /// what the interval store keeps.
    pub fn collide_cmp(&self, other: &Range) -> Ordering {
        if self.collides(other) {
            Ordering::Equal
        } else {
            self.start.cmp(&other.start)
        }
    }

    /// The overlapping sub-range, or [`Range::EMPTY`].
    pub fn intersect(&self, other: &Range) -> Range {
        if !self.collides(other) {
            return Range::EMPTY;
        }
        let start = self.start.max(other.start);
        let end = self.end().min(other.end());
        Range::new(start, end - start)
    }

    /// Splits `self` around `other`: the part before it, the overlap, and the
    /// part after it. Parts that would be empty are returned as
    /// [`Range::EMPTY`].
    pub fn partition(&self, other: &Range) -> (Range, Range, Range) {
        let mid = self.intersect(other);
        if mid.is_empty() {
            return (*self, Range::EMPTY, Range::EMPTY);
        }
        let before = if self.start < mid.start {
            Range::new(self.start, mid.start - self.start)
        } else {
            Range::EMPTY
        };
        let after = if mid.end() < self.end() {
            Range::new(mid.end(), self.end() - mid.end())
        } else {
            Range::EMPTY
        };
        (before, mid, after)
    }

    /// Takes the first `n` sats, returning `(head, tail)`.
    pub fn split_at(&self, n: i64) -> (Range, Range) {
        if n <= 0 {
            return (Range::EMPTY, *self);
        }
        if n >= self.size {
            return (*self, Range::EMPTY);
        }
        (
            Range::new(self.start, n),
            Range::new(self.start + n, self.size - n),
        )
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end())
    }
}

/// Total number of sats covered by `ranges`.
pub fn total_size(ranges: &[Range]) -> i64 {
    ranges.iter().map(|r| r.size).sum()
}

/// Takes the first `amount` sats from the front of `ranges`, splitting the
/// range at the boundary if needed. Consumed ranges are drained.
pub fn take_front(ranges: &mut std::collections::VecDeque<Range>, mut amount: i64) -> Vec<Range> {
    let mut taken = Vec::new();
    while amount > 0 {
        let Some(front) = ranges.pop_front() else {
            break;
        };
        let (head, tail) = front.split_at(amount);
        amount -= head.size;
        taken.push(head);
        if !tail.is_empty() {
            ranges.push_front(tail);
        }
    }
    taken
}
