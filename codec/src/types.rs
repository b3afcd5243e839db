//! Implementations of the codec traits for common types.

use crate::{EncodeSize, Error, Read, Write};
use bytes::{Buf, BufMut, Bytes};

macro_rules! impl_primitive {
    ($type:ty, $get:ident, $put:ident) => {
        impl Write for $type {
            #[inline]
            fn write(&self, buf: &mut impl BufMut) {
                buf.$put(*self);
            }
        }

        impl EncodeSize for $type {
            #[inline]
            fn encode_size(&self) -> usize {
                std::mem::size_of::<$type>()
            }
        }

        impl Read for $type {
            #[inline]
            fn read(buf: &mut impl Buf) -> Result<Self, Error> {
                if buf.remaining() < std::mem::size_of::<$type>() {
                    return Err(Error::EndOfBuffer);
                }
                Ok(buf.$get())
            }
        }
    };
}

impl_primitive!(u8, get_u8, put_u8);
impl_primitive!(u16, get_u16, put_u16);
impl_primitive!(u32, get_u32, put_u32);
impl_primitive!(u64, get_u64, put_u64);
impl_primitive!(i64, get_i64, put_i64);

impl Write for bool {
    #[inline]
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_u8(u8::from(*self));
    }
}

impl EncodeSize for bool {
    #[inline]
    fn encode_size(&self) -> usize {
        1
    }
}

impl Read for bool {
    #[inline]
    fn read(buf: &mut impl Buf) -> Result<Self, Error> {
        match u8::read(buf)? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(Error::InvalidBool),
        }
    }
}

/// Size of the `u32` length prefix carried by variable-length values.
const LEN_PREFIX: usize = 4;

/// Writes a collection length as a `u32` prefix.
///
/// # Panics
///
/// Panics if `len` does not fit in a `u32`.
fn write_len(len: usize, buf: &mut impl BufMut) {
    let len = u32::try_from(len).expect("length exceeds u32::MAX");
    buf.put_u32(len);
}

/// Reads a `u32` length prefix and checks it against the bytes that remain.
fn read_len(buf: &mut impl Buf, min_item_size: usize) -> Result<usize, Error> {
    let len = u32::read(buf)? as usize;
    let required = len.saturating_mul(min_item_size);
    if required > buf.remaining() {
        return Err(Error::EndOfBuffer);
    }
    Ok(len)
}

impl Write for String {
    fn write(&self, buf: &mut impl BufMut) {
        write_len(self.len(), buf);
        buf.put_slice(self.as_bytes());
    }
}

impl EncodeSize for String {
    fn encode_size(&self) -> usize {
        LEN_PREFIX + self.len()
    }
}

impl Read for String {
    fn read(buf: &mut impl Buf) -> Result<Self, Error> {
        let len = read_len(buf, 1)?;
        let mut raw = vec![0u8; len];
        buf.copy_to_slice(&mut raw);
        String::from_utf8(raw).map_err(|err| Error::InvalidData("String", err.to_string()))
    }
}

impl Write for Bytes {
    fn write(&self, buf: &mut impl BufMut) {
        write_len(self.len(), buf);
        buf.put_slice(self);
    }
}

impl EncodeSize for Bytes {
    fn encode_size(&self) -> usize {
        LEN_PREFIX + self.len()
    }
}

impl Read for Bytes {
    fn read(buf: &mut impl Buf) -> Result<Self, Error> {
        let len = read_len(buf, 1)?;
        Ok(buf.copy_to_bytes(len))
    }
}

impl<T: Write> Write for Vec<T> {
    fn write(&self, buf: &mut impl BufMut) {
        write_len(self.len(), buf);
        for item in self {
            item.write(buf);
        }
    }
}

impl<T: EncodeSize> EncodeSize for Vec<T> {
    fn encode_size(&self) -> usize {
        LEN_PREFIX + self.iter().map(EncodeSize::encode_size).sum::<usize>()
    }
}

impl<T: Read> Read for Vec<T> {
    fn read(buf: &mut impl Buf) -> Result<Self, Error> {
        // Every item consumes at least one byte, so a length larger than the
        // remaining buffer can be rejected before allocating.
        let len = read_len(buf, 1)?;
        let mut items = Vec::with_capacity(len);
        for _ in 0..len {
            items.push(T::read(buf)?);
        }
        Ok(items)
    }
}

impl<T: Write> Write for Option<T> {
    fn write(&self, buf: &mut impl BufMut) {
        self.is_some().write(buf);
        if let Some(inner) = self {
            inner.write(buf);
        }
    }
}

impl<T: EncodeSize> EncodeSize for Option<T> {
    fn encode_size(&self) -> usize {
        1 + self.as_ref().map_or(0, EncodeSize::encode_size)
    }
}

impl<T: Read> Read for Option<T> {
    fn read(buf: &mut impl Buf) -> Result<Self, Error> {
        if bool::read(buf)? {
            Ok(Some(T::read(buf)?))
        } else {
            Ok(None)
        }
    }
}
