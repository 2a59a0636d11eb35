use std::collections::BTreeMap;

use bytes::Bytes;

use crate::bencode::{decode, encode, Value};

use super::error::PeerError;

/// Extended message id of the extension handshake itself (BEP-10).
pub const EXTENSION_HANDSHAKE_ID: u8 = 0;

/// The extended message id we assign to `ut_metadata` in our handshake;
/// the remote addresses its data messages to this id.
pub const UT_METADATA_LOCAL_ID: u8 = 1;

/// The BEP-10 extension handshake, reduced to the `ut_metadata` concern.
#[derive(Debug, Clone, Default)]
pub struct ExtensionHandshake {
    pub extensions: BTreeMap<String, u8>,
    pub metadata_size: Option<i64>,
}

impl ExtensionHandshake {
    /// The handshake the leech sends: advertise `ut_metadata` under
    /// [`UT_METADATA_LOCAL_ID`], claim no metadata of our own.
    pub fn ours() -> Self {
        let mut extensions = BTreeMap::new();
        extensions.insert("ut_metadata".to_string(), UT_METADATA_LOCAL_ID);
        Self {
            extensions,
            metadata_size: Some(0),
        }
    }

    /// The remote's extended message id for `ut_metadata`, if advertised.
    pub fn ut_metadata_id(&self) -> Option<u8> {
        self.extensions.get("ut_metadata").copied()
    }

    pub fn encode(&self) -> Bytes {
        let mut m = BTreeMap::new();
        for (name, id) in &self.extensions {
            m.insert(
                Bytes::copy_from_slice(name.as_bytes()),
                Value::Integer(i64::from(*id)),
            );
        }

        let mut dict = BTreeMap::new();
        dict.insert(Bytes::from_static(b"m"), Value::Dict(m));
        if let Some(size) = self.metadata_size {
            dict.insert(Bytes::from_static(b"metadata_size"), Value::Integer(size));
        }

        Bytes::from(encode(&Value::Dict(dict)))
    }

    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        let value = decode(data)?;
        let dict = value
            .as_dict()
            .ok_or_else(|| PeerError::InvalidMessage("extension handshake not a dict".into()))?;

        let mut handshake = Self::default();

        if let Some(m) = dict.get(b"m".as_slice()).and_then(|v| v.as_dict()) {
            for (name, id) in m {
                if let (Ok(name), Some(id)) = (std::str::from_utf8(name), id.as_integer()) {
                    // id 0 means the remote disabled the extension.
                    if let Ok(id) = u8::try_from(id) {
                        if id > 0 {
                            handshake.extensions.insert(name.to_string(), id);
                        }
                    }
                }
            }
        }

        handshake.metadata_size = dict
            .get(b"metadata_size".as_slice())
            .and_then(|v| v.as_integer());

        Ok(handshake)
    }
}
