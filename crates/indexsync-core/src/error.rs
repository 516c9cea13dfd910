//! Codec Error Types
//!
//! Every failure to turn stored bytes back into a payload is reported as a
//! [`CodecError`]. These errors are **not retryable**: the same bytes will
//! fail the same way on every attempt, so callers route the offending event
//! to the poison path instead of retrying it.
//!
//! ## Error Categories
//!
//! ### Framing Errors
//! - `Truncated`: Input ended while a field was being read
//! - `TrailingBytes`: Input contains bytes after a complete payload
//! - `LengthOutOfRange`: A length prefix points past the end of the input
//! - `VarintOverflow`: A varint uses more than 64 bits
//!
//! ### Format Errors
//! - `UnsupportedVersion`: Payload was written by an unknown format version
//! - `InvalidFlags`: Reserved flag bits are set
//! - `InvalidUtf8`: A string field is not valid UTF-8

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Truncated input while reading {0}")]
    Truncated(&'static str),

    #[error("Varint exceeds 64 bits")]
    VarintOverflow,

    #[error("Unsupported format version: {0}")]
    UnsupportedVersion(u8),

    #[error("Invalid flags: {0:#010b}")]
    InvalidFlags(u8),

    #[error("Length {len} exceeds remaining {remaining} bytes")]
    LengthOutOfRange { len: u64, remaining: usize },

    #[error("Invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
}

pub type Result<T> = std::result::Result<T, CodecError>;
