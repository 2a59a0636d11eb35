use thiserror::Error;

/// Errors produced while decoding an `info` dictionary.
#[derive(Debug, Error)]
pub enum MetainfoError {
    /// The info hash is not exactly 20 bytes (or 40 hex characters).
    #[error("invalid info hash length")]
    InvalidInfoHashLength,

    /// The metadata is not valid bencode.
    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    /// A required dictionary key is missing.
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// A dictionary key has the wrong type or an out-of-range value.
    #[error("invalid field: {0}")]
    InvalidField(&'static str),

    /// The sum of file lengths is zero.
    #[error("torrent has zero total size")]
    ZeroSize,

    /// A file path contains a rejected component (`..`, empty, or absolute).
    #[error("unsafe file path")]
    UnsafePath,
}
