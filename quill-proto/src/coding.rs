//! Primitive wire encoding and decoding
//!
//! Wire types implement [`Codec`]; the [`BufExt`]/[`BufMutExt`] extension
//! traits let parsers read and write them, along with variable-length
//! integers, without spelling out bounds checks at every call site.

use std::mem;

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::VarInt;

/// The buffer ran out before a complete value could be read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("buffer too short for a complete value")]
pub struct UnexpectedEnd;

pub type Result<T> = std::result::Result<T, UnexpectedEnd>;

/// A value with a self-contained wire encoding
///
/// Encoding is infallible; decoding fails only when the buffer is exhausted.
pub trait Codec: Sized {
    /// Parse a value from the front of `buf`
    fn decode<B: Buf>(buf: &mut B) -> Result<Self>;
    /// Append this value's encoding to `buf`
    fn encode<B: BufMut>(&self, buf: &mut B);
}

// Fixed-width big-endian integers. Only the widths the packet and parameter
// parsers consume are wired up; varint-coded fields go through `get_var`.
macro_rules! int_codec {
    ($ty:ty, $get:ident, $put:ident) => {
        impl Codec for $ty {
            fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
                if buf.remaining() < mem::size_of::<$ty>() {
                    return Err(UnexpectedEnd);
                }
                Ok(buf.$get())
            }

            fn encode<B: BufMut>(&self, buf: &mut B) {
                buf.$put(*self);
            }
        }
    };
}

int_codec!(u8, get_u8, put_u8);
int_codec!(u32, get_u32, put_u32);

/// Reads typed values out of a buffer
pub trait BufExt {
    /// Decode a value from the front of the buffer
    fn get<T: Codec>(&mut self) -> Result<T>;
    /// Decode a variable-length integer from the front of the buffer
    fn get_var(&mut self) -> Result<u64>;
}

impl<B: Buf> BufExt for B {
    fn get<T: Codec>(&mut self) -> Result<T> {
        T::decode(self)
    }

    fn get_var(&mut self) -> Result<u64> {
        VarInt::decode(self).map(VarInt::into_inner)
    }
}

/// Writes typed values into a buffer
pub trait BufMutExt {
    /// Append a value's encoding to the buffer
    fn write<T: Codec>(&mut self, value: T);
    /// Append a variable-length integer to the buffer
    fn write_var(&mut self, value: u64);
}

impl<B: BufMut> BufMutExt for B {
    fn write<T: Codec>(&mut self, value: T) {
        value.encode(self);
    }

    fn write_var(&mut self, value: u64) {
        VarInt::from_u64(value)
            .expect("varint-coded quantities stay below 2^62")
            .encode(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_roundtrip() {
        let mut buf = Vec::new();
        buf.write(0xab_u8);
        buf.write(0x1234_5678_u32);
        let mut r = &buf[..];
        assert_eq!(BufExt::get::<u8>(&mut r), Ok(0xab));
        assert_eq!(BufExt::get::<u32>(&mut r), Ok(0x1234_5678));
        assert_eq!(BufExt::get::<u8>(&mut r), Err(UnexpectedEnd));
    }

    #[test]
    fn truncated_read_fails_without_consuming() {
        let mut r = &[0xab, 0xcd][..];
        assert_eq!(BufExt::get::<u32>(&mut r), Err(UnexpectedEnd));
        assert_eq!(r.remaining(), 2);
    }

    #[test]
    fn var_roundtrip() {
        let mut buf = Vec::new();
        buf.write_var(0);
        buf.write_var(494_878_333);
        let mut r = &buf[..];
        assert_eq!(r.get_var(), Ok(0));
        assert_eq!(r.get_var(), Ok(494_878_333));
        assert_eq!(r.get_var(), Err(UnexpectedEnd));
    }
}
