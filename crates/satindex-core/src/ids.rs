//! 64-bit surrogate keys for UTXOs and addresses.
//!
//! A [`UtxoId`] packs `(height, tx_index, vout)` as 24/20/20 bits, which
//! keeps ids of the same block adjacent in byte order and is reversible
//! without a table lookup. The `txid:vout` string stays the external
//! identity; the ledger persists the mapping both ways.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;

const HEIGHT_BITS: u32 = 24;
const TX_BITS: u32 = 20;
const VOUT_BITS: u32 = 20;

const TX_SHIFT: u32 = VOUT_BITS;
const HEIGHT_SHIFT: u32 = VOUT_BITS + TX_BITS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UtxoId(pub u64);

impl UtxoId {
    pub fn new(height: u64, tx_index: u64, vout: u64) -> Result<Self, IndexerError> {
        check("height", height, HEIGHT_BITS)?;
        check("tx index", tx_index, TX_BITS)?;
        check("vout", vout, VOUT_BITS)?;
        Ok(Self(height << HEIGHT_SHIFT | tx_index << TX_SHIFT | vout))
    }

    pub fn height(&self) -> u64 {
        self.0 >> HEIGHT_SHIFT
    }

    pub fn tx_index(&self) -> u64 {
        (self.0 >> TX_SHIFT) & mask(TX_BITS)
    }

    pub fn vout(&self) -> u64 {
        self.0 & mask(VOUT_BITS)
    }

    pub fn to_be_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for UtxoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.height(), self.tx_index(), self.vout())
    }
}

/// Address surrogate key, assigned sequentially on first sight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AddressId(pub u64);

impl AddressId {
    pub fn to_be_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for AddressId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// External `txid:vout` identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: String,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: impl Into<String>, vout: u32) -> Self {
        Self {
            txid: txid.into(),
            vout,
        }
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

fn mask(bits: u32) -> u64 {
    (1u64 << bits) - 1
}

fn check(what: &'static str, value: u64, bits: u32) -> Result<(), IndexerError> {
    if value > mask(bits) {
        return Err(IndexerError::IdOverflow { what, value });
    }
    Ok(())
}
