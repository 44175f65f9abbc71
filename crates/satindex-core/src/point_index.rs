//! Point index: ordered map from a single sat coordinate to a value.
//!
//! The ledger stores each block's first sat here, so "which block does sat
//! `n` belong to" is a predecessor search.

use std::collections::BTreeMap;

use crate::range::Range;

#[derive(Debug, Clone)]
pub struct PointIndex<V> {
    points: BTreeMap<i64, V>,
}

impl<V> Default for PointIndex<V> {
    fn default() -> Self {
        Self {
            points: BTreeMap::new(),
        }
    }
}

impl<V> PointIndex<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Insert or replace the value at `point`.
    pub fn put(&mut self, point: i64, value: V) -> Option<V> {
        self.points.insert(point, value)
    }

    pub fn find_node(&self, point: i64) -> Option<&V> {
        self.points.get(&point)
    }

    pub fn find_node_mut(&mut self, point: i64) -> Option<&mut V> {
        self.points.get_mut(&point)
    }

    /// The entry with the largest key not exceeding `point`.
    pub fn find_first_smaller(&self, point: i64) -> Option<(i64, &V)> {
        self.points
            .range(..=point)
            .next_back()
            .map(|(k, v)| (*k, v))
    }

    /// All entries with `range.start <= key <= range.end()`.
    ///
    /// Both bounds are inclusive; callers wanting the half-open range filter
    /// out `key == range.end()` themselves.
    pub fn find_sat_values_with_range(&self, range: &Range) -> BTreeMap<i64, &V> {
        if range.size < 0 {
            return BTreeMap::new();
        }
        self.points
            .range(range.start..=range.end())
            .map(|(k, v)| (*k, v))
            .collect()
    }

    /// Remove every entry [`find_sat_values_with_range`] would return and
    /// give back the removed keys.
    ///
    /// [`find_sat_values_with_range`]: PointIndex::find_sat_values_with_range
    pub fn remove_sats_with_range(&mut self, range: &Range) -> Vec<i64> {
        if range.size < 0 {
            return Vec::new();
        }
        let keys: Vec<i64> = self
            .points
            .range(range.start..=range.end())
            .map(|(k, _)| *k)
            .collect();
        for k in &keys {
            self.points.remove(k);
        }
        keys
    }

    pub fn iter(&self) -> impl Iterator<Item = (i64, &V)> {
        self.points.iter().map(|(k, v)| (*k, v))
    }
}
