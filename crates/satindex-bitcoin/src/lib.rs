//! satindex-bitcoin: sat ledger, ordinals sub-indexers and the index loop.

pub mod builder;
pub mod fetcher;
pub mod holders;
pub mod index_loop;
pub mod keys;
pub mod ledger;
pub mod name;
pub mod nft;
pub mod query;
pub mod rarity;
pub mod sat;
pub mod set;
pub mod ticker;

#[cfg(test)]
mod test_chain;

pub use builder::IndexerBuilder;
pub use fetcher::{BitcoinFetcher, BitcoinRpcClient, EnvelopeParser, NoEnvelopes};
pub use index_loop::{IndexLoop, ShutdownHandle};
pub use query::ReadModel;
pub use set::IndexerSet;
