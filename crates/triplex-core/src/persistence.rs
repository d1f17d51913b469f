//! Tagged binary persistence format
//!
//! Every structure writes a short literal tag followed by scalars in `bincode`'s
//! fixed-width little-endian encoding and raw arena windows. Loading checks the tag
//! first and aborts on any mismatch.

use crate::error::{StoreError, StoreResult};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::{Read, Write};

/// Tags longer than this are treated as corrupt input
const MAX_TAG_LENGTH: u64 = 256;

fn encode<W: Write, T: Serialize + ?Sized>(writer: &mut W, value: &T) -> StoreResult<()> {
    bincode::serialize_into(writer, value)?;
    Ok(())
}

fn decode<R: Read, T: DeserializeOwned>(reader: &mut R) -> StoreResult<T> {
    Ok(bincode::deserialize_from(reader)?)
}

pub fn write_tag<W: Write>(writer: &mut W, tag: &str) -> StoreResult<()> {
    encode(writer, tag)
}

/// Consume the next tag and fail unless it equals `expected`
pub fn check_tag<R: Read>(reader: &mut R, expected: &str) -> StoreResult<()> {
    // The length is read on its own so a corrupt one is rejected before allocating
    let length = read_u64(reader)?;
    if length > MAX_TAG_LENGTH {
        return Err(StoreError::invalid_tag(expected, &format!("<{length} bytes>")));
    }
    let mut found = vec![0u8; length as usize];
    reader.read_exact(&mut found)?;
    if found != expected.as_bytes() {
        return Err(StoreError::invalid_tag(expected, &String::from_utf8_lossy(&found)));
    }
    Ok(())
}

pub fn write_u64<W: Write>(writer: &mut W, value: u64) -> StoreResult<()> {
    encode(writer, &value)
}

pub fn read_u64<R: Read>(reader: &mut R) -> StoreResult<u64> {
    decode(reader)
}

pub fn write_usize<W: Write>(writer: &mut W, value: usize) -> StoreResult<()> {
    write_u64(writer, value as u64)
}

pub fn read_usize<R: Read>(reader: &mut R) -> StoreResult<usize> {
    let value = read_u64(reader)?;
    usize::try_from(value).map_err(|_| {
        StoreError::serialization("usize", "load", format!("Value {value} does not fit in usize"))
    })
}

pub fn write_bool<W: Write>(writer: &mut W, value: bool) -> StoreResult<()> {
    encode(writer, &value)
}

pub fn read_bool<R: Read>(reader: &mut R) -> StoreResult<bool> {
    decode(reader)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_tag_mismatch_is_rejected() {
        let mut buffer = Vec::new();
        write_tag(&mut buffer, "OneKeyIndex").unwrap();

        let err = check_tag(&mut Cursor::new(&buffer), "ThreeKeysIndex").unwrap_err();
        assert!(err.to_string().contains("cannot load ThreeKeysIndex"));
        assert!(check_tag(&mut Cursor::new(&buffer), "OneKeyIndex").is_ok());
    }

    #[test]
    fn test_truncated_input_is_a_serialization_error() {
        let mut buffer = Vec::new();
        write_tag(&mut buffer, "SequentialHashIndex").unwrap();
        buffer.truncate(10);

        let err = check_tag(&mut Cursor::new(&buffer), "SequentialHashIndex").unwrap_err();
        assert_eq!(err.category(), "serialization");
    }

    #[test]
    fn test_oversized_tag_length_is_rejected_without_allocating() {
        let mut buffer = Vec::new();
        write_u64(&mut buffer, u64::MAX).unwrap();
        assert!(check_tag(&mut Cursor::new(&buffer), "OneKeyIndex").is_err());
    }

    #[test]
    fn test_scalars_are_fixed_width_little_endian() {
        let mut buffer = Vec::new();
        write_tag(&mut buffer, "Ab").unwrap();
        write_usize(&mut buffer, 0x0102).unwrap();
        write_bool(&mut buffer, false).unwrap();
        assert_eq!(buffer, [2, 0, 0, 0, 0, 0, 0, 0, b'A', b'b', 2, 1, 0, 0, 0, 0, 0, 0, 0]);

        let mut reader = Cursor::new(&buffer);
        check_tag(&mut reader, "Ab").unwrap();
        assert_eq!(read_usize(&mut reader).unwrap(), 0x0102);
        assert!(!read_bool(&mut reader).unwrap());
    }

    #[test]
    fn test_bool_encoding() {
        let mut buffer = Vec::new();
        write_bool(&mut buffer, true).unwrap();
        buffer.push(7);
        let mut reader = Cursor::new(&buffer);
        assert!(read_bool(&mut reader).unwrap());
        assert!(read_bool(&mut reader).is_err());
    }
}
