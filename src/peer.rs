//! Metadata leech: BitTorrent wire protocol, extension protocol, and
//! `ut_metadata` (BEP-3, BEP-10, BEP-9)
//!
//! For every infohash the sink admits, this module connects to the peers
//! that were observed announcing it, negotiates the extension protocol,
//! downloads the `info` dictionary piecewise, and verifies its SHA-1
//! against the infohash before decoding. Nothing else of the wire protocol
//! is spoken: the leech never requests content pieces.

mod error;
mod extension;
mod leech;
mod message;
mod metadata;
mod peer_id;
mod transport;

pub use error::{FailureKind, PeerError, SessionFailure};
pub use extension::ExtensionHandshake;
pub use leech::{fetch_from_peer, fetch_metadata, FetchError, LeechConfig};
pub use message::{Handshake, Message, HANDSHAKE_LEN};
pub use metadata::{MetadataBuffer, MetadataMessage, METADATA_PIECE_SIZE};
pub use peer_id::PeerId;
pub use transport::PeerTransport;

#[cfg(test)]
mod tests;
