use std::collections::BTreeMap;

use bytes::Bytes;

use super::value::Value;

/// Encodes a bencode value into freshly allocated bytes.
///
/// Encoding cannot fail: every [`Value`] has exactly one wire form, and
/// dictionary keys come out of the [`BTreeMap`] already byte-sorted, which
/// makes the output canonical. Decoding a canonical buffer and encoding the
/// result reproduces it bit for bit.
///
/// # Examples
///
/// ```
/// use dredge::bencode::{encode, Value};
///
/// assert_eq!(encode(&Value::Integer(-7)), b"i-7e");
/// assert_eq!(encode(&Value::string("spam")), b"4:spam");
/// ```
pub fn encode(value: &Value) -> Vec<u8> {
    let mut encoder = Encoder { out: Vec::new() };
    encoder.value(value);
    encoder.out
}

struct Encoder {
    out: Vec<u8>,
}

impl Encoder {
    fn value(&mut self, value: &Value) {
        match value {
            Value::Integer(i) => self.integer(*i),
            Value::Bytes(b) => self.bytes(b),
            Value::List(items) => self.list(items),
            Value::Dict(entries) => self.dict(entries),
        }
    }

    fn integer(&mut self, i: i64) {
        self.out.push(b'i');
        self.out.extend_from_slice(i.to_string().as_bytes());
        self.out.push(b'e');
    }

    // Also emits dictionary keys, which share the length-prefixed form.
    fn bytes(&mut self, b: &[u8]) {
        self.out.extend_from_slice(b.len().to_string().as_bytes());
        self.out.push(b':');
        self.out.extend_from_slice(b);
    }

    fn list(&mut self, items: &[Value]) {
        self.out.push(b'l');
        for item in items {
            self.value(item);
        }
        self.out.push(b'e');
    }

    fn dict(&mut self, entries: &BTreeMap<Bytes, Value>) {
        self.out.push(b'd');
        for (key, value) in entries {
            self.bytes(key);
            self.value(value);
        }
        self.out.push(b'e');
    }
}
