use std::fmt;

use sha1::{Digest, Sha1};

use super::error::MetainfoError;

/// A BitTorrent v1 info hash: the SHA-1 of the bencoded `info` dictionary.
///
/// This is the identifier the whole pipeline is keyed on. Compared by value;
/// rendered as lowercase hex only at logging and storage boundaries.
///
/// [BEP-3]: http://bittorrent.org/beps/bep_0003.html
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    /// Creates an info hash from a 20-byte slice.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MetainfoError> {
        if bytes.len() != 20 {
            return Err(MetainfoError::InvalidInfoHashLength);
        }
        let mut hash = [0u8; 20];
        hash.copy_from_slice(bytes);
        Ok(Self(hash))
    }

    /// Computes the info hash of raw `info` dictionary bytes.
    pub fn from_info_bytes(info_bytes: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(info_bytes);
        Self(hasher.finalize().into())
    }

    /// Parses an info hash from a 40-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, MetainfoError> {
        if s.len() != 40 {
            return Err(MetainfoError::InvalidInfoHashLength);
        }
        let bytes = hex_decode(s).ok_or(MetainfoError::InvalidInfoHashLength)?;
        Self::from_bytes(&bytes)
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Converts to a lowercase hexadecimal string.
    pub fn to_hex(&self) -> String {
        self.0
            .iter()
            .fold(String::with_capacity(40), |mut s, b| {
                use std::fmt::Write;
                let _ = write!(s, "{:02x}", b);
                s
            })
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", self.to_hex())
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}
