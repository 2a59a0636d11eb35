//! dredge - an autonomous BitTorrent DHT crawler and metadata fetcher
//!
//! dredge joins the Mainline DHT without trackers or seed databases,
//! harvests freshly-announced infohashes by impersonating many short-lived
//! node identities, fetches the corresponding torrent metadata from the
//! announcing peers over `ut_metadata` (BEP-9), and persists verified
//! results with their file lists for later full-text search.
//!
//! # Modules
//!
//! - [`bencode`] - BEP-3 bencode encoding/decoding
//! - [`dht`] - BEP-5/51 DHT harvesting engine
//! - [`peer`] - BEP-3/10/9 metadata leech
//! - [`metainfo`] - info hashes and decoded torrent metadata
//! - [`sink`] - dedup, admission control, and fetch dispatch
//! - [`persistence`] - the database contract and SQLite backend

pub mod bencode;
pub mod dht;
pub mod metainfo;
pub mod peer;
pub mod persistence;
pub mod sink;

pub use bencode::{decode, encode, BencodeError, Value};
pub use dht::{DhtConfig, DhtService, NodeId, Observation, ObservationQueue};
pub use metainfo::{InfoHash, MetainfoError, TorrentFile, TorrentInfo};
pub use peer::{FailureKind, FetchError, LeechConfig, PeerError};
pub use persistence::{open_database, Database, PersistenceError, SqliteDatabase};
pub use sink::{Sink, SinkConfig};
