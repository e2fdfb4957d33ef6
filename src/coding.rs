//! Bounds-checked buffer reads for header decoding

use bytes::Buf;
use thiserror::Error;

/// Buffer ran out of bytes mid-field
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
#[error("unexpected end of buffer")]
pub struct UnexpectedEnd;

pub(crate) type Result<T> = ::std::result::Result<T, UnexpectedEnd>;

pub(crate) trait Codec: Sized {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self>;
}

impl Codec for u8 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < 1 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u8())
    }
}

impl Codec for u32 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < 4 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u32())
    }
}

pub(crate) trait BufExt {
    fn get<T: Codec>(&mut self) -> Result<T>;
    /// Decode a QUIC variable-length integer
    fn get_var(&mut self) -> Result<u64>;
}

impl<B: Buf> BufExt for B {
    fn get<T: Codec>(&mut self) -> Result<T> {
        T::decode(self)
    }

    fn get_var(&mut self) -> Result<u64> {
        if !self.has_remaining() {
            return Err(UnexpectedEnd);
        }
        let mut bytes = [0; 8];
        bytes[0] = self.get_u8();
        let tag = bytes[0] >> 6;
        bytes[0] &= 0b0011_1111;
        Ok(match tag {
            0b00 => u64::from(bytes[0]),
            0b01 => {
                if self.remaining() < 1 {
                    return Err(UnexpectedEnd);
                }
                self.copy_to_slice(&mut bytes[1..2]);
                u64::from(u16::from_be_bytes(bytes[..2].try_into().unwrap()))
            }
            0b10 => {
                if self.remaining() < 3 {
                    return Err(UnexpectedEnd);
                }
                self.copy_to_slice(&mut bytes[1..4]);
                u64::from(u32::from_be_bytes(bytes[..4].try_into().unwrap()))
            }
            0b11 => {
                if self.remaining() < 7 {
                    return Err(UnexpectedEnd);
                }
                self.copy_to_slice(&mut bytes[1..8]);
                u64::from_be_bytes(bytes)
            }
            _ => unreachable!(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn var_int_lengths() {
        let cases: &[(&[u8], u64)] = &[
            (&[0x25], 0x25),
            (&[0x7b, 0xbd], 0x3bbd),
            (&[0x9d, 0x7f, 0x3e, 0x7d], 0x1d7f3e7d),
            (
                &[0xc2, 0x19, 0x7c, 0x5e, 0xff, 0x14, 0xe8, 0x8c],
                0x2197c5eff14e88c,
            ),
        ];
        for (bytes, expected) in cases {
            assert_eq!(Cursor::new(bytes).get_var(), Ok(*expected));
        }
    }

    #[test]
    fn var_int_truncated() {
        assert_eq!(Cursor::new(&[][..]).get_var(), Err(UnexpectedEnd));
        assert_eq!(Cursor::new(&[0x7b][..]).get_var(), Err(UnexpectedEnd));
        assert_eq!(
            Cursor::new(&[0xc2, 0x19, 0x7c][..]).get_var(),
            Err(UnexpectedEnd)
        );
    }
}
