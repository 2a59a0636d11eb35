//! Persistence layer: the database contract and its SQLite backend
//!
//! The crawler needs exactly three things from storage: a fast existence
//! check, an idempotent insert keyed on the info hash, and a clean
//! shutdown. Everything else (search, statistics, pagination) belongs to
//! whatever reads the database later; the schema carries a full-text index
//! over names for that purpose.

mod error;
mod sqlite;

pub use error::PersistenceError;
pub use sqlite::SqliteDatabase;

use std::sync::Arc;

use crate::metainfo::{InfoHash, TorrentFile};

/// The storage contract the sink writes through.
///
/// Implementations must be safe to call from `spawn_blocking` contexts and
/// must enforce `UNIQUE(info_hash)`: a second [`add_new_torrent`] for the
/// same hash is a silent no-op.
///
/// [`add_new_torrent`]: Database::add_new_torrent
pub trait Database: Send + Sync {
    /// Whether this infohash has already been stored.
    fn exists(&self, info_hash: &InfoHash) -> Result<bool, PersistenceError>;

    /// Stores a newly discovered torrent with its file list.
    ///
    /// Rejects a zero total size. Idempotent on `info_hash`.
    fn add_new_torrent(
        &self,
        info_hash: &InfoHash,
        name: &str,
        files: &[TorrentFile],
    ) -> Result<(), PersistenceError>;

    /// Flushes and releases the store.
    fn close(&self) -> Result<(), PersistenceError>;
}

/// Opens a database from a URL of the form `<engine>://<location>`.
///
/// `sqlite3://` is the supported engine. `postgresql://` is recognized but
/// not yet wired up; anything else is an invalid URL. Both are
/// startup-fatal.
pub fn open_database(url: &str) -> Result<Arc<dyn Database>, PersistenceError> {
    match url.split_once("://") {
        Some(("sqlite3", path)) if !path.is_empty() => {
            Ok(Arc::new(SqliteDatabase::open(std::path::Path::new(path))?))
        }
        Some(("postgresql", _)) => Err(PersistenceError::UnsupportedEngine("postgresql")),
        _ => Err(PersistenceError::InvalidUrl(url.to_string())),
    }
}
