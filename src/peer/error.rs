use std::fmt;

use thiserror::Error;

/// Errors that can occur during a metadata fetch session.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Network I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A per-operation deadline or the session wall budget expired.
    #[error("timeout")]
    Timeout,

    /// The peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// The peer's handshake is not a BitTorrent handshake.
    #[error("invalid handshake")]
    InvalidHandshake,

    /// The peer echoed a different info hash.
    #[error("info hash mismatch")]
    InfoHashMismatch,

    /// The peer did not set the extension-protocol reserved bit.
    #[error("extension protocol not supported")]
    ExtensionBitMissing,

    /// The peer supports extensions but not `ut_metadata`, or advertised
    /// no usable metadata size.
    #[error("ut_metadata unsupported")]
    MetadataUnsupported,

    /// Advertised metadata size exceeds the safety cap.
    #[error("metadata too large: {0} bytes")]
    MetadataTooLarge(i64),

    /// The peer rejected a metadata piece request.
    #[error("peer rejected piece {0}")]
    PieceRejected(u32),

    /// SHA-1 of the assembled metadata does not equal the info hash.
    #[error("metadata hash mismatch")]
    Sha1Mismatch,

    /// Received a malformed wire or extension message.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Error decoding bencode in extension messages or the metadata itself.
    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    /// The verified metadata failed to decode into a torrent.
    #[error("metadata decode error: {0}")]
    Metainfo(#[from] crate::metainfo::MetainfoError),
}

/// Per-peer failure taxonomy reported to the sink.
///
/// Every failed session collapses into one of these reasons; the sink only
/// counts and logs them, it never inspects the underlying error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    ConnectFail,
    HandshakeMismatch,
    ExtUnsupported,
    MetadataTooLarge,
    PieceTimeout,
    Sha1Mismatch,
    BencodeInvalid,
    PeerDropped,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::ConnectFail => "connect_fail",
            FailureKind::HandshakeMismatch => "handshake_mismatch",
            FailureKind::ExtUnsupported => "ext_unsupported",
            FailureKind::MetadataTooLarge => "metadata_too_large",
            FailureKind::PieceTimeout => "piece_timeout",
            FailureKind::Sha1Mismatch => "sha1_mismatch",
            FailureKind::BencodeInvalid => "bencode_invalid",
            FailureKind::PeerDropped => "peer_dropped",
        };
        f.write_str(name)
    }
}

/// A failed session: the taxonomy bucket plus the error that put it there.
#[derive(Debug, Error)]
#[error("{kind}: {error}")]
pub struct SessionFailure {
    pub kind: FailureKind,
    pub error: PeerError,
}
