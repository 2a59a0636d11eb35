use thiserror::Error;

/// Errors produced by the DHT layer.
///
/// Per-packet problems never escape the service loop; they are counted in
/// [`DhtStats`](super::DhtStats) instead. This type covers message assembly
/// and socket setup, where a caller can actually act on the failure.
#[derive(Debug, Error)]
pub enum DhtError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("malformed message: {0}")]
    Malformed(String),
}
