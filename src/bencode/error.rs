use thiserror::Error;

/// Errors that can occur during bencode decoding.
#[derive(Debug, Error)]
pub enum BencodeError {
    /// Input ended before a complete value was parsed.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// Integer is malformed: empty, leading zeros, or overflows `i64`.
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    /// Byte string length prefix is not a valid number.
    #[error("invalid string length")]
    InvalidStringLength,

    /// Dictionary key is not a byte string.
    #[error("dictionary key must be a byte string")]
    NonStringKey,

    /// Encountered an unexpected byte while parsing.
    #[error("unexpected byte: 0x{0:02x}")]
    UnexpectedByte(u8),

    /// Extra data exists after the value.
    #[error("trailing data after value")]
    TrailingData,

    /// Recursion limit exceeded.
    #[error("nesting too deep")]
    NestingTooDeep,
}
