//! Codec error taxonomy
use thiserror::Error;

pub type DecodeResult<T> = Result<T, DecodeError>;
pub type EncodeResult<T> = Result<T, EncodeError>;

/// Failures while reading a message off the wire
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// input ended before the message did
    #[error("buffer truncated")]
    Truncated,
    /// the v4 magic cookie did not match 0x63825363
    #[error("bad magic cookie: {cookie:#010x}")]
    BadMagic { cookie: u32 },
    /// an option's declared length runs past the end of the options field
    #[error("option {code} length {len} overflows remaining input {remaining}")]
    LengthOverflow { code: u16, len: usize, remaining: usize },
    /// the same option code appeared more than once. The decode keeps the
    /// last occurrence and flags the message.
    #[error("duplicate option {code}")]
    DuplicateOption { code: u16 },
    /// v6 only: a message type the server is required to understand but
    /// does not. Mapped to a status-code reply by the engine.
    #[error("unknown mandatory v6 message type {0}")]
    UnknownMandatory(u8),
    /// a field held bytes that are not valid for its type
    #[error("invalid value in field {field}")]
    InvalidField { field: &'static str },
}

/// Failures while serializing a message
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// an option value exceeds the single-TLV length limit
    #[error("option {code} value length {len} exceeds wire limit")]
    LengthOverflow { code: u16, len: usize },
}
