use thiserror::Error;

/// Errors surfaced by the persistence layer.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("torrent has zero total size")]
    ZeroSize,

    #[error("unsupported database engine: {0}")]
    UnsupportedEngine(&'static str),

    #[error("invalid database url: {0}")]
    InvalidUrl(String),
}
