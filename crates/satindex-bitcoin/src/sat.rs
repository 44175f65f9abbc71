//! Sat arithmetic: issuance schedule, sat → block, rarity, and named
//! attribute ranges.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use satindex_core::range::Range;
use satindex_core::range_store::RangeIntervalStore;

pub const COIN: i64 = 100_000_000;
pub const HALVING_INTERVAL: u64 = 210_000;
pub const DIFFCHANGE_INTERVAL: u64 = 2_016;
/// Six halvings; the first block of a cycle starts both a halving epoch and
/// a difficulty period.
pub const CYCLE_INTERVAL: u64 = 6 * HALVING_INTERVAL;
const INITIAL_SUBSIDY: i64 = 50 * COIN;
const MAX_EPOCHS: u64 = 64;

/// Coinbases at these heights reused the txid of an earlier, still unspent
/// coinbase `(duplicate, original)`. The original outputs were overwritten
/// and their sats are lost.
pub const DUPLICATE_COINBASES: [(u64, u64); 2] = [(91_842, 91_812), (91_880, 91_722)];

pub fn is_known_duplicate(height: u64) -> bool {
    DUPLICATE_COINBASES.iter().any(|(dup, _)| *dup == height)
}

fn epoch_subsidy(epoch: u64) -> i64 {
    if epoch >= MAX_EPOCHS {
        0
    } else {
        INITIAL_SUBSIDY >> epoch
    }
}

/// Block subsidy in sats.
pub fn subsidy(height: u64) -> i64 {
    epoch_subsidy(height / HALVING_INTERVAL)
}

/// Number of the first sat mined in the block at `height`.
pub fn starting_sat(height: u64) -> i64 {
    let mut sat = 0;
    let mut epoch = 0;
    let mut remaining = height;
    while remaining > 0 && epoch < MAX_EPOCHS {
        let blocks = remaining.min(HALVING_INTERVAL);
        sat += blocks as i64 * epoch_subsidy(epoch);
        remaining -= blocks;
        epoch += 1;
    }
    sat
}

/// The sats created as subsidy of the block at `height`.
pub fn subsidy_range(height: u64) -> Range {
    Range::new(starting_sat(height), subsidy(height))
}

/// Height of the block that mined `sat`, or `None` past the last sat.
pub fn sat_height(sat: i64) -> Option<u64> {
    if sat < 0 {
        return None;
    }
    let mut first = 0i64;
    for epoch in 0..MAX_EPOCHS {
        let per_block = epoch_subsidy(epoch);
        if per_block == 0 {
            return None;
        }
        let epoch_sats = per_block * HALVING_INTERVAL as i64;
        if sat < first + epoch_sats {
            return Some(epoch * HALVING_INTERVAL + ((sat - first) / per_block) as u64);
        }
        first += epoch_sats;
    }
    None
}

// ─── Rarity ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rarity {
    Common,
    Uncommon,
    Rare,
    Epic,
    Legendary,
    Mythic,
}

impl Rarity {
    /// Rarity of a single sat. Only the first sat of a block is ever above
    /// common.
    pub fn of(sat: i64) -> Rarity {
        if sat == 0 {
            return Rarity::Mythic;
        }
        let Some(height) = sat_height(sat) else {
            return Rarity::Common;
        };
        if starting_sat(height) != sat {
            Rarity::Common
        } else if height % CYCLE_INTERVAL == 0 {
            Rarity::Legendary
        } else if height % HALVING_INTERVAL == 0 {
            Rarity::Epic
        } else if height % DIFFCHANGE_INTERVAL == 0 {
            Rarity::Rare
        } else {
            Rarity::Uncommon
        }
    }
}

impl fmt::Display for Rarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Common => "common",
            Self::Uncommon => "uncommon",
            Self::Rare => "rare",
            Self::Epic => "epic",
            Self::Legendary => "legendary",
            Self::Mythic => "mythic",
        };
        f.write_str(s)
    }
}

// ─── Named attributes ────────────────────────────────────────────────────────

/// Collector attributes attached to fixed historical sat ranges. Ranges
/// overlap, so a sat may carry several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attribute {
    /// Mined in blocks 0 to 999.
    Vintage,
    /// Mined in block 9, the coinbase of the first transaction.
    Block9,
    /// Mined in block 78, the first block not mined by Satoshi.
    Block78,
    /// Mined in the first halving epoch.
    FirstEpoch,
}

pub fn attribute_ranges() -> Vec<(Range, Attribute)> {
    vec![
        (Range::new(0, starting_sat(1_000)), Attribute::Vintage),
        (subsidy_range(9), Attribute::Block9),
        (subsidy_range(78), Attribute::Block78),
        (Range::new(0, starting_sat(HALVING_INTERVAL)), Attribute::FirstEpoch),
    ]
}

/// Every attribute range folded into one store; overlaps carry the union.
pub fn attribute_store() -> RangeIntervalStore<BTreeSet<Attribute>> {
    let mut store = RangeIntervalStore::new();
    for (range, attribute) in attribute_ranges() {
        store.add_mint_info(range, attribute);
    }
    store
}
