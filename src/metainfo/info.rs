use crate::bencode::{decode, Value};

use super::error::MetainfoError;
use super::info_hash::InfoHash;

/// A single file inside a torrent.
///
/// Paths are stored as sanitized, `/`-joined UTF-8 strings: that is what the
/// persistence layer indexes, and the crawler never touches the filesystem
/// with them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    /// Path relative to the torrent root, `/`-separated.
    pub path: String,
    /// File size in bytes.
    pub size: u64,
}

/// Decoded torrent metadata, normalized from the `info` dictionary.
///
/// Single-file and multi-file layouts collapse into the same shape: a name
/// and a non-empty file list with a positive total size.
#[derive(Debug, Clone)]
pub struct TorrentInfo {
    /// Torrent name. Synthesized from the info hash when the dictionary
    /// carries none.
    pub name: String,
    /// Sum of all file sizes. Always greater than zero.
    pub total_size: u64,
    /// Files in the torrent, at least one.
    pub files: Vec<TorrentFile>,
}

impl TorrentInfo {
    /// Decodes a verified `info` dictionary.
    ///
    /// The caller is expected to have checked `SHA1(data) == info_hash`
    /// already; the hash is only used here to synthesize a name for
    /// dictionaries that lack one.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is not a bencoded dictionary, a file
    /// entry is malformed, a path contains `..`/empty components, or the
    /// total size is zero.
    pub fn from_info_dict(info_hash: &InfoHash, data: &[u8]) -> Result<Self, MetainfoError> {
        let value = decode(data)?;
        let dict = value.as_dict().ok_or(MetainfoError::InvalidField("info"))?;

        let name = match dict.get(b"name".as_slice()).and_then(|v| v.as_bytes()) {
            Some(raw) if !raw.is_empty() => match clean_text(raw) {
                cleaned if cleaned.is_empty() => info_hash.to_hex(),
                cleaned => cleaned,
            },
            _ => info_hash.to_hex(),
        };

        let files = match dict.get(b"files".as_slice()) {
            Some(files_value) => parse_multi_file(files_value)?,
            None => {
                let length = dict
                    .get(b"length".as_slice())
                    .and_then(|v| v.as_integer())
                    .ok_or(MetainfoError::MissingField("length"))?;
                let size = u64::try_from(length)
                    .map_err(|_| MetainfoError::InvalidField("length"))?;
                // The name doubles as the file path here, so it gets the
                // same treatment as a multi-file path segment.
                vec![TorrentFile {
                    path: sanitize_component(name.as_bytes())?,
                    size,
                }]
            }
        };

        let total_size = files.iter().map(|f| f.size).sum();
        if total_size == 0 {
            return Err(MetainfoError::ZeroSize);
        }

        Ok(Self {
            name,
            total_size,
            files,
        })
    }
}

fn parse_multi_file(value: &Value) -> Result<Vec<TorrentFile>, MetainfoError> {
    let entries = value
        .as_list()
        .ok_or(MetainfoError::InvalidField("files"))?;

    if entries.is_empty() {
        return Err(MetainfoError::InvalidField("files"));
    }

    let mut files = Vec::with_capacity(entries.len());
    for entry in entries {
        let dict = entry.as_dict().ok_or(MetainfoError::InvalidField("files"))?;

        let length = dict
            .get(b"length".as_slice())
            .and_then(|v| v.as_integer())
            .ok_or(MetainfoError::MissingField("length"))?;
        let size = u64::try_from(length).map_err(|_| MetainfoError::InvalidField("length"))?;

        let segments = dict
            .get(b"path".as_slice())
            .and_then(|v| v.as_list())
            .ok_or(MetainfoError::MissingField("path"))?;

        if segments.is_empty() {
            return Err(MetainfoError::UnsafePath);
        }

        let mut path = String::new();
        for segment in segments {
            let raw = segment
                .as_bytes()
                .ok_or(MetainfoError::InvalidField("path"))?;
            let component = sanitize_component(raw)?;
            if !path.is_empty() {
                path.push('/');
            }
            path.push_str(&component);
        }

        files.push(TorrentFile { path, size });
    }

    Ok(files)
}

/// Strips NUL bytes and lossily replaces invalid UTF-8.
fn clean_text(raw: &[u8]) -> String {
    let cleaned: Vec<u8> = raw.iter().copied().filter(|&b| b != 0).collect();
    String::from_utf8_lossy(&cleaned).into_owned()
}

/// Sanitizes one path segment: [`clean_text`] plus rejection of traversal
/// and empty components. Torrent names are only cleaned; path segments get
/// the full treatment because they reconstruct a relative path.
fn sanitize_component(raw: &[u8]) -> Result<String, MetainfoError> {
    let component = clean_text(raw);

    if component.is_empty() || component == "." || component == ".." {
        return Err(MetainfoError::UnsafePath);
    }
    if component.contains('/') || component.contains('\\') {
        return Err(MetainfoError::UnsafePath);
    }

    Ok(component)
}
