// Canonical wire serialization: compact-size varints, little-endian
// integers, and length-prefixed byte strings

use crate::core::Hash256;
use std::io::{Cursor, Read};
use thiserror::Error;

/// Refuse to allocate more than this for a single length-prefixed field
const MAX_FIELD_LEN: u64 = 32 * 1024 * 1024;

/// Decoding failure, carrying the byte offset it was detected at
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("unexpected end of input at byte {offset}")]
    UnexpectedEof { offset: u64 },
    #[error("malformed data at byte {offset}: {reason}")]
    Malformed { offset: u64, reason: String },
}

impl CodecError {
    pub fn malformed(offset: u64, reason: impl Into<String>) -> Self {
        CodecError::Malformed {
            offset,
            reason: reason.into(),
        }
    }
}

/// Types with a canonical byte representation.
///
/// Round-trip exactness is part of the contract: decoding the output of
/// `serialize` reproduces the value, and re-serializing reproduces the bytes.
pub trait Serializable: Sized {
    /// Append the canonical encoding to `buf`
    fn encode(&self, buf: &mut Vec<u8>);

    /// Read one value from the cursor, leaving it positioned after it
    fn decode(cur: &mut Cursor<&[u8]>) -> Result<Self, CodecError>;

    /// Canonical encoding as a fresh buffer
    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }

    /// Decode from a complete buffer
    fn deserialize(data: &[u8]) -> Result<Self, CodecError> {
        let mut cur = Cursor::new(data);
        Self::decode(&mut cur)
    }
}

pub fn read_bytes<const N: usize>(cur: &mut Cursor<&[u8]>) -> Result<[u8; N], CodecError> {
    let offset = cur.position();
    let mut buf = [0u8; N];
    cur.read_exact(&mut buf)
        .map_err(|_| CodecError::UnexpectedEof { offset })?;
    Ok(buf)
}

pub fn read_u8(cur: &mut Cursor<&[u8]>) -> Result<u8, CodecError> {
    Ok(read_bytes::<1>(cur)?[0])
}

pub fn read_u16_le(cur: &mut Cursor<&[u8]>) -> Result<u16, CodecError> {
    Ok(u16::from_le_bytes(read_bytes(cur)?))
}

pub fn read_u32_le(cur: &mut Cursor<&[u8]>) -> Result<u32, CodecError> {
    Ok(u32::from_le_bytes(read_bytes(cur)?))
}

pub fn read_i32_le(cur: &mut Cursor<&[u8]>) -> Result<i32, CodecError> {
    Ok(i32::from_le_bytes(read_bytes(cur)?))
}

pub fn read_u64_le(cur: &mut Cursor<&[u8]>) -> Result<u64, CodecError> {
    Ok(u64::from_le_bytes(read_bytes(cur)?))
}

pub fn read_i64_le(cur: &mut Cursor<&[u8]>) -> Result<i64, CodecError> {
    Ok(i64::from_le_bytes(read_bytes(cur)?))
}

pub fn read_hash(cur: &mut Cursor<&[u8]>) -> Result<Hash256, CodecError> {
    Ok(Hash256::new(read_bytes(cur)?))
}

/// Write a compact-size integer (1/3/5/9 bytes tagged by the first byte)
pub fn write_varint(buf: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xfc => buf.push(value as u8),
        0xfd..=0xffff => {
            buf.push(0xfd);
            buf.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x10000..=0xffff_ffff => {
            buf.push(0xfe);
            buf.extend_from_slice(&(value as u32).to_le_bytes());
        }
        _ => {
            buf.push(0xff);
            buf.extend_from_slice(&value.to_le_bytes());
        }
    }
}

/// Read a compact-size integer
pub fn read_varint(cur: &mut Cursor<&[u8]>) -> Result<u64, CodecError> {
    match read_u8(cur)? {
        tag @ 0..=0xfc => Ok(tag as u64),
        0xfd => Ok(read_u16_le(cur)? as u64),
        0xfe => Ok(read_u32_le(cur)? as u64),
        0xff => read_u64_le(cur),
    }
}

/// Write bytes with a varint length prefix
pub fn write_var_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    write_varint(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

/// Read bytes with a varint length prefix
pub fn read_var_bytes(cur: &mut Cursor<&[u8]>) -> Result<Vec<u8>, CodecError> {
    let offset = cur.position();
    let len = read_varint(cur)?;
    if len > MAX_FIELD_LEN {
        return Err(CodecError::malformed(
            offset,
            format!("field length {len} exceeds limit"),
        ));
    }
    let offset = cur.position();
    let mut data = vec![0u8; len as usize];
    cur.read_exact(&mut data)
        .map_err(|_| CodecError::UnexpectedEof { offset })?;
    Ok(data)
}

/// Write a varint-length-prefixed UTF-8 string
pub fn write_var_string(buf: &mut Vec<u8>, s: &str) {
    write_var_bytes(buf, s.as_bytes());
}

/// Read a varint-length-prefixed UTF-8 string
pub fn read_var_string(cur: &mut Cursor<&[u8]>) -> Result<String, CodecError> {
    let offset = cur.position();
    let bytes = read_var_bytes(cur)?;
    String::from_utf8(bytes).map_err(|_| CodecError::malformed(offset, "invalid utf-8 string"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip_varint(value: u64, expected_len: usize) {
        let mut buf = Vec::new();
        write_varint(&mut buf, value);
        assert_eq!(buf.len(), expected_len);
        let mut cur = Cursor::new(buf.as_slice());
        assert_eq!(read_varint(&mut cur).unwrap(), value);
        assert_eq!(cur.position() as usize, buf.len());
    }

    #[test]
    fn test_varint_widths() {
        round_trip_varint(0, 1);
        round_trip_varint(100, 1);
        round_trip_varint(0xfc, 1);
        round_trip_varint(0xfd, 3);
        round_trip_varint(1000, 3);
        round_trip_varint(0xffff, 3);
        round_trip_varint(0x10000, 5);
        round_trip_varint(100_000, 5);
        round_trip_varint(0xffff_ffff, 5);
        round_trip_varint(0x1_0000_0000, 9);
        round_trip_varint(u64::MAX, 9);
    }

    #[test]
    fn test_var_bytes_round_trip() {
        let data = b"hello world";
        let mut buf = Vec::new();
        write_var_bytes(&mut buf, data);
        let mut cur = Cursor::new(buf.as_slice());
        assert_eq!(read_var_bytes(&mut cur).unwrap(), data);
    }

    #[test]
    fn test_var_string_round_trip() {
        let mut buf = Vec::new();
        write_var_string(&mut buf, "/crown-core:0.1.0/");
        let mut cur = Cursor::new(buf.as_slice());
        assert_eq!(read_var_string(&mut cur).unwrap(), "/crown-core:0.1.0/");
    }

    #[test]
    fn test_eof_reports_offset() {
        let buf = [0xfdu8, 0x01]; // truncated 3-byte varint
        let mut cur = Cursor::new(buf.as_slice());
        match read_varint(&mut cur) {
            Err(CodecError::UnexpectedEof { offset }) => assert_eq!(offset, 1),
            other => panic!("expected eof error, got {other:?}"),
        }
    }

    #[test]
    fn test_oversized_field_rejected() {
        let mut buf = Vec::new();
        write_varint(&mut buf, MAX_FIELD_LEN + 1);
        let mut cur = Cursor::new(buf.as_slice());
        assert!(matches!(
            read_var_bytes(&mut cur),
            Err(CodecError::Malformed { offset: 0, .. })
        ));
    }

    #[test]
    fn test_fixed_width_readers() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0xdeadbeefu32.to_le_bytes());
        buf.extend_from_slice(&(-7i64).to_le_bytes());
        let mut cur = Cursor::new(buf.as_slice());
        assert_eq!(read_u32_le(&mut cur).unwrap(), 0xdeadbeef);
        assert_eq!(read_i64_le(&mut cur).unwrap(), -7);
    }
}
