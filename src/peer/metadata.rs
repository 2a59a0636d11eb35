use std::collections::BTreeMap;

use bytes::Bytes;

use crate::bencode::{decode_prefix, encode, Value};

use super::error::PeerError;

/// Metadata piece size fixed by BEP-9.
pub const METADATA_PIECE_SIZE: usize = 16384;

/// A `ut_metadata` message (BEP-9).
///
/// On the wire this is a bencoded header; for data messages the raw piece
/// bytes follow the header immediately in the same extension payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataMessage {
    Request { piece: u32 },
    Data { piece: u32, total_size: i64, data: Bytes },
    Reject { piece: u32 },
}

impl MetadataMessage {
    pub fn request(piece: u32) -> Self {
        MetadataMessage::Request { piece }
    }

    pub fn encode(&self) -> Bytes {
        let (msg_type, piece, total_size, data) = match self {
            MetadataMessage::Request { piece } => (0, *piece, None, None),
            MetadataMessage::Data {
                piece,
                total_size,
                data,
            } => (1, *piece, Some(*total_size), Some(data)),
            MetadataMessage::Reject { piece } => (2, *piece, None, None),
        };

        let mut dict = BTreeMap::new();
        dict.insert(Bytes::from_static(b"msg_type"), Value::Integer(msg_type));
        dict.insert(
            Bytes::from_static(b"piece"),
            Value::Integer(i64::from(piece)),
        );
        if let Some(total_size) = total_size {
            dict.insert(Bytes::from_static(b"total_size"), Value::Integer(total_size));
        }

        let mut out = encode(&Value::Dict(dict));
        if let Some(data) = data {
            out.extend_from_slice(data);
        }
        Bytes::from(out)
    }

    /// Decodes the bencoded header and, for data messages, takes the raw
    /// trailing bytes as the piece payload.
    pub fn decode(payload: &[u8]) -> Result<Self, PeerError> {
        let (header, consumed) = decode_prefix(payload)?;
        let dict = header
            .as_dict()
            .ok_or_else(|| PeerError::InvalidMessage("ut_metadata header not a dict".into()))?;

        let msg_type = dict
            .get(b"msg_type".as_slice())
            .and_then(|v| v.as_integer())
            .ok_or_else(|| PeerError::InvalidMessage("missing msg_type".into()))?;

        let piece = dict
            .get(b"piece".as_slice())
            .and_then(|v| v.as_integer())
            .and_then(|p| u32::try_from(p).ok())
            .ok_or_else(|| PeerError::InvalidMessage("missing piece".into()))?;

        match msg_type {
            0 => Ok(MetadataMessage::Request { piece }),
            1 => {
                let total_size = dict
                    .get(b"total_size".as_slice())
                    .and_then(|v| v.as_integer())
                    .ok_or_else(|| PeerError::InvalidMessage("missing total_size".into()))?;
                Ok(MetadataMessage::Data {
                    piece,
                    total_size,
                    data: Bytes::copy_from_slice(&payload[consumed..]),
                })
            }
            2 => Ok(MetadataMessage::Reject { piece }),
            other => Err(PeerError::InvalidMessage(format!(
                "unknown ut_metadata msg_type {}",
                other
            ))),
        }
    }
}

/// Assembles metadata pieces at their indexed offsets.
///
/// Wire order is irrelevant: each piece lands at `piece * 16384`. Every
/// piece except the last must be exactly [`METADATA_PIECE_SIZE`] bytes.
pub struct MetadataBuffer {
    buf: Vec<u8>,
    received: Vec<bool>,
    remaining: usize,
}

impl MetadataBuffer {
    pub fn new(total_size: usize) -> Self {
        let pieces = total_size.div_ceil(METADATA_PIECE_SIZE);
        Self {
            buf: vec![0u8; total_size],
            received: vec![false; pieces],
            remaining: pieces,
        }
    }

    pub fn piece_count(&self) -> usize {
        self.received.len()
    }

    /// Expected length of piece `piece`.
    pub fn piece_len(&self, piece: u32) -> usize {
        let offset = piece as usize * METADATA_PIECE_SIZE;
        self.buf.len().saturating_sub(offset).min(METADATA_PIECE_SIZE)
    }

    /// Places one piece. Duplicate pieces are ignored; a wrong-sized piece
    /// fails the session.
    pub fn insert(&mut self, piece: u32, data: &[u8]) -> Result<(), PeerError> {
        let index = piece as usize;
        if index >= self.received.len() {
            return Err(PeerError::InvalidMessage(format!(
                "piece {} out of range",
                piece
            )));
        }
        if data.len() != self.piece_len(piece) {
            return Err(PeerError::InvalidMessage(format!(
                "piece {} has length {}, expected {}",
                piece,
                data.len(),
                self.piece_len(piece)
            )));
        }

        if !self.received[index] {
            let offset = index * METADATA_PIECE_SIZE;
            self.buf[offset..offset + data.len()].copy_from_slice(data);
            self.received[index] = true;
            self.remaining -= 1;
        }
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }

    /// Returns the assembled metadata. Callers check completeness first.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}
