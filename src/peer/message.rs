use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::metainfo::InfoHash;

use super::error::PeerError;
use super::peer_id::PeerId;

/// The BitTorrent protocol identifier.
pub const PROTOCOL: &[u8] = b"BitTorrent protocol";
/// Length of the handshake message in bytes.
pub const HANDSHAKE_LEN: usize = 68;

/// Extension-protocol message id (BEP-10).
const EXTENDED_ID: u8 = 20;

/// The fixed 68-byte BitTorrent handshake.
///
/// The leech sets exactly one reserved bit: byte 5, bit 4, the extension
/// protocol (BEP-10), which `ut_metadata` rides on. Everything else the
/// remote may advertise is ignored.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub info_hash: InfoHash,
    pub peer_id: [u8; 20],
    pub reserved: [u8; 8],
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        let mut reserved = [0u8; 8];
        reserved[5] |= 0x10;
        Self {
            info_hash,
            peer_id: peer_id.0,
            reserved,
        }
    }

    pub fn supports_extension_protocol(&self) -> bool {
        (self.reserved[5] & 0x10) != 0
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(19);
        buf.put_slice(PROTOCOL);
        buf.put_slice(&self.reserved);
        buf.put_slice(self.info_hash.as_bytes());
        buf.put_slice(&self.peer_id);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        if data.len() < HANDSHAKE_LEN {
            return Err(PeerError::InvalidHandshake);
        }
        if data[0] != 19 || &data[1..20] != PROTOCOL {
            return Err(PeerError::InvalidHandshake);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);

        let info_hash =
            InfoHash::from_bytes(&data[28..48]).map_err(|_| PeerError::InvalidHandshake)?;

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(Self {
            info_hash,
            peer_id,
            reserved,
        })
    }
}

/// A peer wire message, reduced to what a metadata leech cares about.
///
/// Only extension-protocol messages are acted on. Everything else a peer
/// may send (bitfields, haves, unchokes) is decoded as [`Message::Other`]
/// and discarded by the session loop.
#[derive(Debug, Clone)]
pub enum Message {
    KeepAlive,
    Extended { id: u8, payload: Bytes },
    Other { id: u8 },
}

impl Message {
    /// Builds an extension message with the 4-byte length prefix.
    pub fn extended(ext_id: u8, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(6 + payload.len());
        buf.put_u32(2 + payload.len() as u32);
        buf.put_u8(EXTENDED_ID);
        buf.put_u8(ext_id);
        buf.put_slice(payload);
        buf.freeze()
    }

    /// Decodes one length-delimited frame (prefix already stripped).
    pub fn decode(mut frame: Bytes) -> Result<Self, PeerError> {
        if frame.is_empty() {
            return Ok(Message::KeepAlive);
        }

        let id = frame.get_u8();
        if id != EXTENDED_ID {
            return Ok(Message::Other { id });
        }

        if frame.is_empty() {
            return Err(PeerError::InvalidMessage("empty extended message".into()));
        }
        let ext_id = frame.get_u8();
        Ok(Message::Extended {
            id: ext_id,
            payload: frame,
        })
    }
}
