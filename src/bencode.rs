//! Bencode encoding and decoding (BEP-3)
//!
//! Bencode is the serialization format used by BitTorrent for DHT messages
//! and torrent metadata. Four data types: integers, byte strings, lists,
//! and dictionaries with byte-string keys.

mod decode;
mod encode;
mod error;
mod value;

pub use decode::{decode, decode_prefix};
pub use encode::encode;
pub use error::BencodeError;
pub use value::Value;
