//! Store key layout.
//!
//! Every key is a short ASCII prefix followed by a big-endian integer or a
//! UTF-8 string, so prefix scans return integer-keyed records in numeric
//! order.

use satindex_core::ids::UtxoId;
use satindex_core::store::key;

pub const BLOCK: &str = "blk/";
pub const UTXO: &str = "utxo/";
pub const OUTPOINT: &str = "opt/";
pub const ADDRESS: &str = "addr/";
pub const ADDRESS_ID: &str = "aid/";
pub const NEXT_ADDRESS: &[u8] = b"meta/next_address";

pub const RARE: &str = "rare/";

pub const INSCRIPTION: &str = "ins/";
pub const NEXT_INSCRIPTION: &[u8] = b"meta/next_inscription";
pub const TICKER: &str = "tick/";
pub const NAME: &str = "name/";

/// Asset-book namespaces.
pub const NFT_BOOK: &str = "nft/";
pub const TICKER_BOOK: &str = "ft/";
pub const NAME_BOOK: &str = "ns/";

pub const MINT: &str = "mint/";
pub const HOLDING: &str = "hold/";
pub const LOCATION: &str = "loc/";

pub fn u64_key(prefix: &str, n: u64) -> Vec<u8> {
    key(prefix, &n.to_be_bytes())
}

pub fn utxo_key(prefix: &str, id: UtxoId) -> Vec<u8> {
    key(prefix, &id.to_be_bytes())
}

pub fn str_key(prefix: &str, s: &str) -> Vec<u8> {
    key(prefix, s.as_bytes())
}

/// Key inside an asset book: `<book><section><suffix>`.
pub fn book_key(book: &str, section: &str, suffix: &[u8]) -> Vec<u8> {
    let mut k = Vec::with_capacity(book.len() + section.len() + suffix.len());
    k.extend_from_slice(book.as_bytes());
    k.extend_from_slice(section.as_bytes());
    k.extend_from_slice(suffix);
    k
}

pub fn decode_u64(suffix: &[u8]) -> Option<u64> {
    Some(u64::from_be_bytes(suffix.try_into().ok()?))
}

pub fn decode_utxo(suffix: &[u8]) -> Option<UtxoId> {
    decode_u64(suffix).map(UtxoId)
}

pub fn decode_str(suffix: &[u8]) -> Option<String> {
    String::from_utf8(suffix.to_vec()).ok()
}
