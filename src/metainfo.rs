//! Torrent metadata model (BEP-3 `info` dictionary)
//!
//! The crawler only ever sees the `info` dictionary, fetched from peers via
//! `ut_metadata` (BEP-9) and verified against its SHA-1. This module decodes
//! that dictionary into the normalized [`TorrentInfo`] shape the persistence
//! layer stores.

mod error;
mod info;
mod info_hash;

pub use error::MetainfoError;
pub use info::{TorrentFile, TorrentInfo};
pub use info_hash::InfoHash;

#[cfg(test)]
mod tests;
