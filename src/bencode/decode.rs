use std::collections::BTreeMap;

use bytes::Bytes;

use super::error::BencodeError;
use super::value::Value;

const MAX_DEPTH: usize = 64;

/// Decodes a single bencode value from a byte slice.
///
/// The input must contain exactly one complete value; trailing data is
/// rejected with [`BencodeError::TrailingData`].
///
/// # Examples
///
/// ```
/// use dredge::bencode::decode;
///
/// let v = decode(b"li1ei2ee").unwrap();
/// assert_eq!(v.as_list().unwrap().len(), 2);
///
/// assert!(decode(b"i42etrailing").is_err());
/// ```
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    let (value, consumed) = decode_prefix(data)?;
    if consumed != data.len() {
        return Err(BencodeError::TrailingData);
    }
    Ok(value)
}

/// Decodes one bencode value from the front of a byte slice, returning the
/// value and the number of bytes consumed.
///
/// Used where a bencoded header is followed by raw payload bytes in the same
/// buffer, as in `ut_metadata` data messages.
pub fn decode_prefix(data: &[u8]) -> Result<(Value, usize), BencodeError> {
    let mut cursor = Cursor { data, pos: 0 };
    let value = cursor.value(0)?;
    Ok((value, cursor.pos))
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof)
    }

    fn value(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::NestingTooDeep);
        }

        match self.peek()? {
            b'i' => self.integer(),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            b'0'..=b'9' => self.bytes().map(Value::Bytes),
            c => Err(BencodeError::UnexpectedByte(c)),
        }
    }

    fn integer(&mut self) -> Result<Value, BencodeError> {
        self.pos += 1;
        let start = self.pos;
        while self.peek()? != b'e' {
            self.pos += 1;
        }

        let digits = &self.data[start..self.pos];
        self.pos += 1;

        parse_int(digits).map(Value::Integer)
    }

    fn bytes(&mut self) -> Result<Bytes, BencodeError> {
        let start = self.pos;
        while self.peek()? != b':' {
            self.pos += 1;
        }

        let len_str = std::str::from_utf8(&self.data[start..self.pos])
            .map_err(|_| BencodeError::InvalidStringLength)?;
        let len: usize = len_str
            .parse()
            .map_err(|_| BencodeError::InvalidStringLength)?;

        self.pos += 1;
        if self.pos + len > self.data.len() {
            return Err(BencodeError::UnexpectedEof);
        }

        let bytes = Bytes::copy_from_slice(&self.data[self.pos..self.pos + len]);
        self.pos += len;
        Ok(bytes)
    }

    fn list(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut list = Vec::new();

        while self.peek()? != b'e' {
            list.push(self.value(depth + 1)?);
        }

        self.pos += 1;
        Ok(Value::List(list))
    }

    fn dict(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut dict = BTreeMap::new();

        while self.peek()? != b'e' {
            if !self.peek()?.is_ascii_digit() {
                return Err(BencodeError::NonStringKey);
            }
            let key = self.bytes()?;
            let value = self.value(depth + 1)?;
            dict.insert(key, value);
        }

        self.pos += 1;
        Ok(Value::Dict(dict))
    }
}

fn parse_int(digits: &[u8]) -> Result<i64, BencodeError> {
    let s =
        std::str::from_utf8(digits).map_err(|_| BencodeError::InvalidInteger("non-ascii".into()))?;

    if s.is_empty() || s == "-" {
        return Err(BencodeError::InvalidInteger("empty".into()));
    }

    // "i-0e" and leading zeros are not canonical bencode.
    if s.starts_with("-0") || (s.starts_with('0') && s.len() > 1) {
        return Err(BencodeError::InvalidInteger("leading zeros".into()));
    }

    s.parse()
        .map_err(|_| BencodeError::InvalidInteger(s.into()))
}
