//! Failures while decoding a record.

use thiserror::Error;

/// A record could not be decoded.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("buffer ended before the record")]
    EndOfBuffer,
    #[error("{0} trailing bytes after the record")]
    ExtraData(usize),
    #[error("invalid {0}: {1}")]
    InvalidData(&'static str, String),
    #[error("unknown {0} tag: {1}")]
    InvalidEnum(&'static str, u8),
    #[error("bool byte is neither 0 nor 1")]
    InvalidBool,
    /// Declared length, then the largest allowed.
    #[error("length {0} exceeds limit {1}")]
    LengthExceeded(usize, usize),
}
