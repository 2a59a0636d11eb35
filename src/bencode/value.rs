use bytes::Bytes;
use std::collections::BTreeMap;

/// A bencode value: one of the four shapes the format knows.
///
/// Byte strings are opaque; nothing here assumes UTF-8. Dictionaries live
/// in a [`BTreeMap`], whose iteration order is exactly the byte-sorted key
/// order canonical bencode requires, so `encode(decode(b)) == b` holds for
/// any canonical input `b`.
///
/// # Examples
///
/// ```
/// use dredge::bencode::{decode, Value};
///
/// let value = decode(b"d4:spami42ee").unwrap();
/// assert_eq!(value.get(b"spam").and_then(Value::as_integer), Some(42));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// A signed 64-bit integer.
    Integer(i64),
    /// A byte string, not necessarily valid UTF-8.
    Bytes(Bytes),
    /// An ordered list of values.
    List(Vec<Value>),
    /// A dictionary keyed by byte strings, sorted by key.
    Dict(BTreeMap<Bytes, Value>),
}

impl Value {
    /// Builds a byte-string value from UTF-8 text.
    pub fn string(s: &str) -> Self {
        Self::Bytes(Bytes::copy_from_slice(s.as_bytes()))
    }

    /// The integer inside, if this is an integer.
    pub fn as_integer(&self) -> Option<i64> {
        if let Self::Integer(i) = self {
            Some(*i)
        } else {
            None
        }
    }

    /// The byte string inside, if this is one.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        if let Self::Bytes(b) = self {
            Some(b)
        } else {
            None
        }
    }

    /// The byte string as UTF-8 text, when it is both a byte string and
    /// valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(self.as_bytes()?).ok()
    }

    /// The list inside, if this is a list.
    pub fn as_list(&self) -> Option<&[Value]> {
        if let Self::List(l) = self {
            Some(l)
        } else {
            None
        }
    }

    /// A borrowed view of the dictionary, if this is one.
    pub fn as_dict(&self) -> Option<&BTreeMap<Bytes, Value>> {
        if let Self::Dict(d) = self {
            Some(d)
        } else {
            None
        }
    }

    /// The owned dictionary, if this is one.
    pub fn into_dict(self) -> Option<BTreeMap<Bytes, Value>> {
        if let Self::Dict(d) = self {
            Some(d)
        } else {
            None
        }
    }

    /// Dictionary lookup; `None` for non-dicts and missing keys alike.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict()?.get(key)
    }
}
