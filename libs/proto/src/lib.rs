//! # proto
//!
//! Wire codec for DHCPv4 and DHCPv6 messages, including option TLVs,
//! relay-agent information, relay-forward nesting, and the DHCPv4-over-DHCPv6
//! envelope.
//!
//! The codec is pure: decoding borrows the input buffer, encoding appends to
//! a caller-owned output buffer, and nothing here does I/O.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod decoder;
pub mod encoder;
pub mod error;
pub mod v4;
pub mod v6;

pub use decoder::Decoder;
pub use encoder::Encoder;
pub use error::{DecodeError, DecodeResult, EncodeError, EncodeResult};

/// A type which can be decoded from a [`Decoder`]
pub trait Decodable: Sized {
    /// Read the type from the decoder's current position
    fn decode(decoder: &mut Decoder<'_>) -> DecodeResult<Self>;

    /// Decode from a byte slice
    fn from_bytes(bytes: &[u8]) -> DecodeResult<Self> {
        Self::decode(&mut Decoder::new(bytes))
    }
}

/// A type which can be encoded into an [`Encoder`]
pub trait Encodable {
    /// Write the type at the encoder's current position
    fn encode(&self, encoder: &mut Encoder<'_>) -> EncodeResult<()>;

    /// Encode to a new byte vec
    fn to_vec(&self) -> EncodeResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(512);
        let mut encoder = Encoder::new(&mut buf);
        self.encode(&mut encoder)?;
        Ok(buf)
    }
}
