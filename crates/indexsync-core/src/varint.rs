//! Variable-length Integer Encoding (Varint)
//!
//! Lengths and counts inside encoded payloads are written as unsigned LEB128
//! varints: 7 data bits per byte, the high bit set while more bytes follow.
//! Small values (0-127) take a single byte, which keeps the common payload
//! (a handful of short dirty paths) to a few dozen bytes.
//!
//! Decoding is fallible: queued payloads come from a shared table and may be
//! truncated or corrupted, so a bad varint is an error, never a panic.
//!
//! ## Usage
//! ```ignore
//! let mut buf = BytesMut::new();
//! encode_varint_u64(&mut buf, 300);
//! let value = decode_varint_u64(&mut buf.as_ref())?;  // Returns 300
//! ```

use crate::error::{CodecError, Result};
use bytes::{Buf, BufMut};

/// Encode an unsigned integer as a varint
pub fn encode_varint_u64(buf: &mut impl BufMut, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;

        if value != 0 {
            byte |= 0x80; // Set continuation bit
        }

        buf.put_u8(byte);

        if value == 0 {
            break;
        }
    }
}

/// Decode a varint to an unsigned integer
pub fn decode_varint_u64(buf: &mut impl Buf) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0;

    loop {
        if !buf.has_remaining() {
            return Err(CodecError::Truncated("varint"));
        }
        let byte = buf.get_u8();
        // The tenth byte only has room for bit 63
        if shift == 63 && byte & 0x7E != 0 {
            return Err(CodecError::VarintOverflow);
        }
        value |= ((byte & 0x7F) as u64) << shift;

        if (byte & 0x80) == 0 {
            break;
        }

        shift += 7;

        if shift >= 64 {
            return Err(CodecError::VarintOverflow);
        }
    }

    Ok(value)
}

/// Write a length-prefixed byte string
pub fn encode_bytes(buf: &mut impl BufMut, bytes: &[u8]) {
    encode_varint_u64(buf, bytes.len() as u64);
    buf.put_slice(bytes);
}

/// Read a length-prefixed UTF-8 string
pub fn decode_string(buf: &mut impl Buf, field: &'static str) -> Result<String> {
    let len = decode_len(buf)?;
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    String::from_utf8(raw).map_err(|_| CodecError::InvalidUtf8(field))
}

/// Read a varint length and check it against the bytes left in `buf`.
pub fn decode_len(buf: &mut impl Buf) -> Result<usize> {
    let len = decode_varint_u64(buf)?;
    let remaining = buf.remaining();
    if len > remaining as u64 {
        return Err(CodecError::LengthOutOfRange { len, remaining });
    }
    Ok(len as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_varint_u64() {
        let mut buf = BytesMut::new();
        encode_varint_u64(&mut buf, 12345);

        let mut cursor = buf.as_ref();
        let decoded = decode_varint_u64(&mut cursor).unwrap();
        assert_eq!(decoded, 12345);
    }

    #[test]
    fn test_varint_u64_127_and_128() {
        // 127 is the largest single-byte value
        let mut buf = BytesMut::new();
        encode_varint_u64(&mut buf, 127);
        assert_eq!(buf.len(), 1);

        let mut buf = BytesMut::new();
        encode_varint_u64(&mut buf, 128);
        assert_eq!(buf.len(), 2);
        assert_eq!(decode_varint_u64(&mut buf.as_ref()).unwrap(), 128);
    }

    #[test]
    fn test_varint_u64_max() {
        let mut buf = BytesMut::new();
        encode_varint_u64(&mut buf, u64::MAX);
        assert_eq!(buf.len(), 10, "u64::MAX should encode to 10 bytes");
        let mut cursor = buf.as_ref();
        assert_eq!(decode_varint_u64(&mut cursor).unwrap(), u64::MAX);
        assert_eq!(cursor.len(), 0);
    }

    #[test]
    fn test_multiple_varints_sequential() {
        let values: Vec<u64> = vec![0, 1, 127, 128, 255, 256, 16383, 16384, u64::MAX];
        let mut buf = BytesMut::new();
        for &v in &values {
            encode_varint_u64(&mut buf, v);
        }
        let mut cursor = buf.as_ref();
        for &expected in &values {
            assert_eq!(decode_varint_u64(&mut cursor).unwrap(), expected);
        }
        assert_eq!(cursor.len(), 0, "Buffer should be fully consumed");
    }

    #[test]
    fn test_varint_truncated() {
        // Continuation bit set but nothing follows
        let mut cursor: &[u8] = &[0x80];
        assert_eq!(
            decode_varint_u64(&mut cursor),
            Err(CodecError::Truncated("varint"))
        );

        let mut empty: &[u8] = &[];
        assert!(decode_varint_u64(&mut empty).is_err());
    }

    #[test]
    fn test_varint_overflow() {
        let mut cursor: &[u8] = &[0xFF; 11];
        assert_eq!(
            decode_varint_u64(&mut cursor),
            Err(CodecError::VarintOverflow)
        );
    }

    #[test]
    fn test_varint_tenth_byte_overflow() {
        let mut bytes = vec![0xFF; 9];
        bytes.push(0x7F);
        let mut cursor = bytes.as_slice();
        assert_eq!(
            decode_varint_u64(&mut cursor),
            Err(CodecError::VarintOverflow)
        );

        // Bit 63 alone still fits
        let mut bytes = vec![0x80; 9];
        bytes.push(0x01);
        assert_eq!(decode_varint_u64(&mut bytes.as_slice()).unwrap(), 1 << 63);
    }

    #[test]
    fn test_string_roundtrip_and_bad_length() {
        let mut buf = BytesMut::new();
        encode_bytes(&mut buf, "title".as_bytes());
        assert_eq!(
            decode_string(&mut buf.as_ref(), "path").unwrap(),
            "title"
        );

        // Length claims 10 bytes, only 2 present
        let mut cursor: &[u8] = &[10, b'a', b'b'];
        assert_eq!(
            decode_string(&mut cursor, "path"),
            Err(CodecError::LengthOutOfRange {
                len: 10,
                remaining: 2
            })
        );
    }

    #[test]
    fn test_string_invalid_utf8() {
        let mut cursor: &[u8] = &[2, 0xC3, 0x28];
        assert_eq!(
            decode_string(&mut cursor, "routing key"),
            Err(CodecError::InvalidUtf8("routing key"))
        );
    }
}
