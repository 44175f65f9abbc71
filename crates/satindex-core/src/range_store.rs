//! Range interval store: ownership of satoshi ranges.
//!
//! Entries are kept pairwise disjoint in a `BTreeMap` keyed by range start,
//! so an overlap query is a predecessor probe plus a forward scan. Callers
//! that may insert overlapping ranges use [`RangeIntervalStore::add_mint_info`],
//! which splits colliding entries instead of replacing them.

use std::collections::{BTreeMap, BTreeSet};

use crate::range::Range;

#[derive(Debug, Clone)]
struct Slot<V> {
    size: i64,
    value: V,
}

/// Ordered container of disjoint `[start, start + size)` ranges.
#[derive(Debug, Clone)]
pub struct RangeIntervalStore<V> {
    entries: BTreeMap<i64, Slot<V>>,
}

impl<V> Default for RangeIntervalStore<V> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<V> RangeIntervalStore<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored fragments.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of sats covered.
    pub fn covered(&self) -> i64 {
        self.entries.values().map(|s| s.size).sum()
    }

    /// Insert an entry the caller knows to be disjoint from everything stored.
    ///
    /// Empty ranges are ignored.
    pub fn put(&mut self, range: Range, value: V) {
        if range.is_empty() {
            return;
        }
        debug_assert!(
            self.first_collision(&range).is_none(),
            "put of overlapping range {range}"
        );
        self.entries.insert(
            range.start,
            Slot {
                size: range.size,
                value,
            },
        );
    }

    /// Every stored entry overlapping `range`, paired with the exact
    /// overlapping sub-range.
    pub fn find_intersections(&self, range: &Range) -> Vec<(Range, &V)> {
        self.colliding(range)
            .map(|(stored, value)| (stored.intersect(range), value))
            .collect()
    }

    /// Every stored entry overlapping `range`, with the stored range verbatim.
    pub fn find_intersections_original_key(&self, range: &Range) -> Vec<(Range, &V)> {
        self.colliding(range).collect()
    }

    /// Remove every entry colliding with `range` and return what was removed.
    pub fn remove_range(&mut self, range: &Range) -> Vec<(Range, V)> {
        let starts: Vec<i64> = self.colliding(range).map(|(r, _)| r.start).collect();
        starts
            .into_iter()
            .filter_map(|start| {
                self.entries
                    .remove(&start)
                    .map(|slot| (Range::new(start, slot.size), slot.value))
            })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Range, &V)> {
        self.entries
            .iter()
            .map(|(start, slot)| (Range::new(*start, slot.size), &slot.value))
    }

    fn first_collision(&self, range: &Range) -> Option<Range> {
        self.colliding(range).next().map(|(r, _)| r)
    }

    fn colliding<'a>(&'a self, range: &Range) -> impl Iterator<Item = (Range, &'a V)> + 'a {
        let query = *range;
        // The entry starting before the query may still reach into it.
        let head = if query.is_empty() {
            None
        } else {
            self.entries
                .range(..query.start)
                .next_back()
                .map(|(start, slot)| (Range::new(*start, slot.size), &slot.value))
                .filter(|(r, _)| r.collides(&query))
        };
        let bounds = if query.is_empty() {
            0..0
        } else {
            query.start..query.end()
        };
        let tail = self
            .entries
            .range(bounds)
            .map(|(start, slot)| (Range::new(*start, slot.size), &slot.value))
            .filter(move |(r, _)| r.collides(&query));
        head.into_iter().chain(tail)
    }
}

impl<T: Ord + Clone> RangeIntervalStore<BTreeSet<T>> {
    /// Insert a possibly-overlapping range tagged with `tag`.
    ///
    /// Every collision with a stored range is split into up to three parts:
    /// the overlap gets the stored tags plus `tag`, the stored range's
    /// remainders keep their tags, and the new range's remainders go back on
    /// the work list until nothing collides. Zero-sized parts are dropped.
    pub fn add_mint_info(&mut self, range: Range, tag: T) {
        let mut pending = vec![range];
        while let Some(piece) = pending.pop() {
            if piece.is_empty() {
                continue;
            }
            let Some(prior) = self.first_collision(&piece) else {
                self.entries.insert(
                    piece.start,
                    Slot {
                        size: piece.size,
                        value: BTreeSet::from([tag.clone()]),
                    },
                );
                continue;
            };
            let Some(slot) = self.entries.remove(&prior.start) else {
                continue;
            };

            let (prior_before, overlap, prior_after) = prior.partition(&piece);
            let (new_before, _, new_after) = piece.partition(&prior);

            let mut merged = slot.value.clone();
            merged.insert(tag.clone());
            for (part, value) in [
                (prior_before, slot.value.clone()),
                (overlap, merged),
                (prior_after, slot.value),
            ] {
                if !part.is_empty() {
                    self.entries.insert(
                        part.start,
                        Slot {
                            size: part.size,
                            value,
                        },
                    );
                }
            }
            pending.push(new_before);
            pending.push(new_after);
        }
    }
}
