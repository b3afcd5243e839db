//! Encode and decode journal records.
//!
//! # Overview
//!
//! A small binary serialization library used to persist transfer records. Every
//! encoding is explicit: a type describes how it writes itself to a buffer ([Write]),
//! how many bytes that takes ([EncodeSize]), and how it reads itself back ([Read]).
//! Nothing is derived through reflection, so the byte layout of a record only changes
//! when its `Write`/`Read` implementations change.
//!
//! All integers are written big-endian. Variable-length values (strings, byte
//! vectors, and vectors of encodable items) carry a `u32` length prefix.
//!
//! # Example
//!
//! ```
//! use bytes::{Buf, BufMut};
//! use courier_codec::{Decode, Encode, EncodeSize, Error, Read, Write};
//!
//! #[derive(Debug, PartialEq)]
//! struct Range {
//!     offset: u64,
//!     label: Option<String>,
//! }
//!
//! impl Write for Range {
//!     fn write(&self, buf: &mut impl BufMut) {
//!         self.offset.write(buf);
//!         self.label.write(buf);
//!     }
//! }
//!
//! impl EncodeSize for Range {
//!     fn encode_size(&self) -> usize {
//!         self.offset.encode_size() + self.label.encode_size()
//!     }
//! }
//!
//! impl Read for Range {
//!     fn read(buf: &mut impl Buf) -> Result<Self, Error> {
//!         let offset = u64::read(buf)?;
//!         let label = Option::<String>::read(buf)?;
//!         Ok(Self { offset, label })
//!     }
//! }
//!
//! let range = Range { offset: 42, label: Some("tail".into()) };
//! let encoded = range.encode();
//! assert_eq!(Range::decode(encoded).unwrap(), range);
//! ```

mod codec;
mod error;
mod types;

pub use codec::{Codec, Decode, Encode, EncodeSize, Read, Write};
pub use error::Error;
