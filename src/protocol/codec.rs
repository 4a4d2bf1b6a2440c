//! Binary encoding of messages
//!
//! Frame format (all integers big-endian):
//! ```text
//! +--------+--------+--------+--------+
//! |   Total length (4B, incl. itself)  |
//! +--------+--------+--------+--------+
//! |          Field count (4B)          |
//! +--------+--------+--------+--------+
//! | Name len (2B) | Name | Tag | Value | ... repeated per field
//! +--------+--------+--------+--------+
//! ```
//!
//! Value layout by tag:
//! - `0x01` int: 8 bytes, two's complement
//! - `0x02` string: 4-byte length + UTF-8
//! - `0x03` bytes: 4-byte length + raw
//! - `0x04` map: 4-byte count + fields
//! - `0x05` list: 4-byte count + (tag + value) per element

use super::{Map, ProtocolError, Value, LENGTH_PREFIX_SIZE, MAX_MESSAGE_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashSet;

pub const TAG_INT: u8 = 0x01;
pub const TAG_STRING: u8 = 0x02;
pub const TAG_BYTES: u8 = 0x03;
pub const TAG_MAP: u8 = 0x04;
pub const TAG_LIST: u8 = 0x05;

/// Nesting limit for maps and lists
const MAX_DEPTH: usize = 32;

/// Encode a field map as a complete frame (length prefix included)
pub fn encode_frame(fields: &Map) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::with_capacity(256);
    buf.put_u32(0); // patched below
    put_map(&mut buf, fields)?;

    let total_len = buf.len();
    if total_len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(total_len));
    }
    buf[..LENGTH_PREFIX_SIZE].copy_from_slice(&(total_len as u32).to_be_bytes());
    Ok(buf.freeze())
}

/// Decode a complete frame (length prefix included)
pub fn decode_frame(frame: &[u8]) -> Result<Map, ProtocolError> {
    let declared = peek_length(frame)?
        .ok_or_else(|| ProtocolError::Malformed("truncated length prefix".to_string()))?;
    if declared != frame.len() {
        return Err(ProtocolError::Malformed(format!(
            "declared length {} but frame holds {} bytes",
            declared,
            frame.len()
        )));
    }
    decode_payload(&frame[LENGTH_PREFIX_SIZE..])
}

/// Decode the payload that follows a length prefix
pub fn decode_payload(payload: &[u8]) -> Result<Map, ProtocolError> {
    let mut reader = Reader { buf: payload };
    let map = reader.map(0)?;
    if reader.buf.has_remaining() {
        return Err(ProtocolError::Malformed(format!(
            "{} trailing bytes after message",
            reader.buf.remaining()
        )));
    }
    Ok(map)
}

/// Read and validate the length prefix at the start of `buf`
///
/// Returns `Ok(None)` when fewer than four bytes are available.
pub fn peek_length(buf: &[u8]) -> Result<Option<usize>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(len));
    }
    if len < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::InvalidLength(len));
    }
    Ok(Some(len))
}

fn put_map(buf: &mut BytesMut, map: &Map) -> Result<(), ProtocolError> {
    buf.put_u32(map.len() as u32);
    for (name, value) in map.iter() {
        if name.len() > u16::MAX as usize {
            return Err(ProtocolError::Malformed(format!(
                "field name of {} bytes",
                name.len()
            )));
        }
        buf.put_u16(name.len() as u16);
        buf.put_slice(name.as_bytes());
        put_value(buf, value)?;
    }
    Ok(())
}

fn put_value(buf: &mut BytesMut, value: &Value) -> Result<(), ProtocolError> {
    match value {
        Value::Int(v) => {
            buf.put_u8(TAG_INT);
            buf.put_i64(*v);
        }
        Value::String(v) => {
            buf.put_u8(TAG_STRING);
            put_blob(buf, v.as_bytes())?;
        }
        Value::Bytes(v) => {
            buf.put_u8(TAG_BYTES);
            put_blob(buf, v)?;
        }
        Value::Map(v) => {
            buf.put_u8(TAG_MAP);
            put_map(buf, v)?;
        }
        Value::List(items) => {
            buf.put_u8(TAG_LIST);
            buf.put_u32(items.len() as u32);
            for item in items {
                put_value(buf, item)?;
            }
        }
    }
    Ok(())
}

fn put_blob(buf: &mut BytesMut, data: &[u8]) -> Result<(), ProtocolError> {
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(data.len()));
    }
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
    Ok(())
}

/// Bounds-checked cursor over a payload
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn need(&self, n: usize, what: &str) -> Result<(), ProtocolError> {
        if self.buf.remaining() < n {
            return Err(ProtocolError::Malformed(format!(
                "truncated {}: need {} bytes, have {}",
                what,
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn u8(&mut self, what: &str) -> Result<u8, ProtocolError> {
        self.need(1, what)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self, what: &str) -> Result<u16, ProtocolError> {
        self.need(2, what)?;
        Ok(self.buf.get_u16())
    }

    fn u32(&mut self, what: &str) -> Result<u32, ProtocolError> {
        self.need(4, what)?;
        Ok(self.buf.get_u32())
    }

    fn i64(&mut self, what: &str) -> Result<i64, ProtocolError> {
        self.need(8, what)?;
        Ok(self.buf.get_i64())
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8], ProtocolError> {
        self.need(n, what)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn text(&mut self, len: usize, what: &str) -> Result<&'a str, ProtocolError> {
        let raw = self.take(len, what)?;
        std::str::from_utf8(raw)
            .map_err(|_| ProtocolError::Malformed(format!("{} is not valid UTF-8", what)))
    }

    fn map(&mut self, depth: usize) -> Result<Map, ProtocolError> {
        if depth > MAX_DEPTH {
            return Err(ProtocolError::Malformed("nesting too deep".to_string()));
        }
        let count = self.u32("field count")? as usize;
        // Every field needs at least 3 bytes, so never trust count for allocation
        let capacity = count.min(self.buf.remaining() / 3);
        let mut map = Map::with_capacity(capacity);
        let mut seen = HashSet::with_capacity(capacity);
        for _ in 0..count {
            let name_len = self.u16("field name length")? as usize;
            let name = self.text(name_len, "field name")?;
            if !seen.insert(name) {
                return Err(ProtocolError::Malformed(format!("duplicate field {}", name)));
            }
            let value = self.value(depth)?;
            map.push_unchecked(name.to_owned(), value);
        }
        Ok(map)
    }

    fn value(&mut self, depth: usize) -> Result<Value, ProtocolError> {
        let tag = self.u8("type tag")?;
        match tag {
            TAG_INT => Ok(Value::Int(self.i64("int value")?)),
            TAG_STRING => {
                let len = self.u32("string length")? as usize;
                Ok(Value::String(self.text(len, "string value")?.to_owned()))
            }
            TAG_BYTES => {
                let len = self.u32("bytes length")? as usize;
                Ok(Value::Bytes(Bytes::copy_from_slice(
                    self.take(len, "bytes value")?,
                )))
            }
            TAG_MAP => Ok(Value::Map(self.map(depth + 1)?)),
            TAG_LIST => {
                if depth + 1 > MAX_DEPTH {
                    return Err(ProtocolError::Malformed("nesting too deep".to_string()));
                }
                let count = self.u32("list length")? as usize;
                let mut items = Vec::with_capacity(count.min(self.buf.remaining()));
                for _ in 0..count {
                    items.push(self.value(depth + 1)?);
                }
                Ok(Value::List(items))
            }
            other => Err(ProtocolError::Malformed(format!(
                "unknown type tag 0x{:02x}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Map {
        Map::new()
            .with("identifier", 7u32)
            .with("command", 1u8)
            .with("host", "example.com")
            .with("data", Bytes::from_static(&[0x45, 0x00, 0x00, 0x14]))
            .with(
                "configuration",
                Map::new().with("IPv4", Map::new().with("Address", "10.0.0.2")),
            )
            .with(
                "protocols",
                vec![Value::Int(4), Value::Int(6), Value::Int(-1)],
            )
    }

    #[test]
    fn test_encode_decode() {
        let original = sample();
        let frame = encode_frame(&original).unwrap();

        let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(declared, frame.len());

        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_empty_map_frame() {
        let frame = encode_frame(&Map::new()).unwrap();
        assert_eq!(&frame[..], &[0, 0, 0, 8, 0, 0, 0, 0]);
        assert!(decode_frame(&frame).unwrap().is_empty());
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let frame = encode_frame(&sample()).unwrap();
        let payload = &frame[LENGTH_PREFIX_SIZE..frame.len() - 3];
        assert!(matches!(
            decode_payload(payload),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_tag_mismatch_rejected() {
        // One field "n", tagged as int but only 2 value bytes follow
        let payload = [0, 0, 0, 1, 0, 1, b'n', TAG_INT, 0, 1];
        assert!(matches!(
            decode_payload(&payload),
            Err(ProtocolError::Malformed(_))
        ));

        // Unknown tag
        let payload = [0, 0, 0, 1, 0, 1, b'n', 0x7f, 0, 0, 0, 0];
        assert!(matches!(
            decode_payload(&payload),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let payload = [0, 0, 0, 0, 0xff];
        assert!(decode_payload(&payload).is_err());
    }

    #[test]
    fn test_duplicate_field_rejected() {
        let payload = [
            0, 0, 0, 2, //
            0, 1, b'n', TAG_INT, 0, 0, 0, 0, 0, 0, 0, 1, //
            0, 1, b'n', TAG_INT, 0, 0, 0, 0, 0, 0, 0, 2,
        ];
        assert!(matches!(
            decode_payload(&payload),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_many_fields_decode() {
        let map: Map = (0..5_000)
            .map(|i| (format!("f{}", i), Value::Int(i)))
            .collect();
        let frame = encode_frame(&map).unwrap();
        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(decoded.len(), 5_000);
        assert_eq!(decoded.get_int("f4999"), Some(4999));
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let payload = [0, 0, 0, 1, 0, 1, b'n', TAG_STRING, 0, 0, 0, 2, 0xc3, 0x28];
        assert!(matches!(
            decode_payload(&payload),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_peek_length_bounds() {
        assert_eq!(peek_length(&[0, 0, 0]).unwrap(), None);
        assert_eq!(peek_length(&[0, 0, 0, 8]).unwrap(), Some(8));
        assert_eq!(
            peek_length(&[0, 0, 0, 3]),
            Err(ProtocolError::InvalidLength(3))
        );

        let too_big = ((MAX_MESSAGE_SIZE + 1) as u32).to_be_bytes();
        assert_eq!(
            peek_length(&too_big),
            Err(ProtocolError::MessageTooLarge(MAX_MESSAGE_SIZE + 1))
        );
    }

    #[test]
    fn test_oversize_message_not_encoded() {
        let map = Map::new().with("data", vec![0u8; MAX_MESSAGE_SIZE]);
        assert!(matches!(
            encode_frame(&map),
            Err(ProtocolError::MessageTooLarge(_))
        ));
    }
}
