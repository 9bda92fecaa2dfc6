//! Write primitives onto a caller-owned output buffer
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::error::EncodeResult;

/// Encoder appends to a caller-owned `Vec<u8>`
#[derive(Debug)]
pub struct Encoder<'a> {
    buffer: &'a mut Vec<u8>,
}

impl<'a> Encoder<'a> {
    pub fn new(buffer: &'a mut Vec<u8>) -> Self {
        Encoder { buffer }
    }

    pub fn write_u8(&mut self, val: u8) -> EncodeResult<()> {
        self.buffer.push(val);
        Ok(())
    }

    pub fn write_u16(&mut self, val: u16) -> EncodeResult<()> {
        self.buffer.extend_from_slice(&val.to_be_bytes());
        Ok(())
    }

    pub fn write_u32(&mut self, val: u32) -> EncodeResult<()> {
        self.buffer.extend_from_slice(&val.to_be_bytes());
        Ok(())
    }

    pub fn write_slice(&mut self, val: &[u8]) -> EncodeResult<()> {
        self.buffer.extend_from_slice(val);
        Ok(())
    }

    pub fn write_ipv4(&mut self, val: Ipv4Addr) -> EncodeResult<()> {
        self.write_slice(&val.octets())
    }

    pub fn write_ipv6(&mut self, val: Ipv6Addr) -> EncodeResult<()> {
        self.write_slice(&val.octets())
    }

    /// write `val` into a fixed-size field of `len` bytes, NUL padded.
    /// `val` is silently truncated to `len`.
    pub fn write_fill_bytes(&mut self, val: &[u8], len: usize) -> EncodeResult<()> {
        let n = val.len().min(len);
        self.buffer.extend_from_slice(&val[..n]);
        self.buffer.extend(std::iter::repeat(0).take(len - n));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_bytes_pads_with_nul() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.write_fill_bytes(b"ab", 4).unwrap();
        assert_eq!(buf, vec![b'a', b'b', 0, 0]);
    }
}
