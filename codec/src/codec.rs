//! Core codec traits

use crate::Error;
use bytes::{Buf, BufMut, BytesMut};

/// Types that can be written to a buffer.
pub trait Write {
    /// Writes this value to `buf`.
    ///
    /// Implementations may assume `buf` has at least [EncodeSize::encode_size] bytes of
    /// remaining capacity.
    fn write(&self, buf: &mut impl BufMut);
}

/// Types that know the exact size of their encoding.
pub trait EncodeSize {
    /// Returns the number of bytes [Write::write] produces for this value.
    fn encode_size(&self) -> usize;
}

/// Types that can be read from a buffer.
pub trait Read: Sized {
    /// Reads a value from `buf`, consuming exactly the bytes of its encoding.
    fn read(buf: &mut impl Buf) -> Result<Self, Error>;
}

/// Types that can be encoded into a freshly allocated buffer.
pub trait Encode: Write + EncodeSize {
    /// Encodes this value.
    ///
    /// # Panics
    ///
    /// Panics if [Write::write] does not produce exactly [EncodeSize::encode_size] bytes.
    fn encode(&self) -> BytesMut {
        let len = self.encode_size();
        let mut buffer = BytesMut::with_capacity(len);
        self.write(&mut buffer);
        assert_eq!(buffer.len(), len, "write() did not write expected bytes");
        buffer
    }
}

impl<T: Write + EncodeSize> Encode for T {}

/// Types that can be decoded from a buffer holding exactly one encoded value.
pub trait Decode: Read {
    /// Decodes a value, failing if any bytes remain afterwards.
    fn decode(mut buf: impl Buf) -> Result<Self, Error> {
        let value = Self::read(&mut buf)?;
        let remaining = buf.remaining();
        if remaining > 0 {
            return Err(Error::ExtraData(remaining));
        }
        Ok(value)
    }
}

impl<T: Read> Decode for T {}

/// Types that can be both encoded and decoded.
pub trait Codec: Encode + Decode {}

impl<T: Encode + Decode> Codec for T {}
