//! Frame accumulation for the read path
//!
//! Transport reads arrive in arbitrary chunks. Bytes are buffered until the
//! declared length of the next frame is fully available, then the frame is
//! split off and decoded. A bad length prefix is fatal: once the prefix can't
//! be trusted there is no way to find the next frame boundary.

use crate::protocol::{codec, Message, ProtocolError, LENGTH_PREFIX_SIZE};
use bytes::BytesMut;

/// Splits a byte stream into messages
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the transport
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes held that do not form a complete frame yet
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Decode the next complete frame, if one is buffered
    pub fn decode_next(&mut self) -> Result<Option<Message>, ProtocolError> {
        let len = match codec::peek_length(&self.buf)? {
            Some(len) => len,
            None => return Ok(None),
        };
        if self.buf.len() < len {
            return Ok(None);
        }

        let frame = self.buf.split_to(len);
        Message::decode_payload(&frame[LENGTH_PREFIX_SIZE..]).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CloseDirection, MAX_MESSAGE_SIZE};
    use bytes::Bytes;

    fn two_frames() -> (Message, Message, Vec<u8>) {
        let first = Message::data(1, Bytes::from_static(b"first"));
        let second = Message::close(2, CloseDirection::All);
        let mut stream = first.encode().unwrap().to_vec();
        stream.extend_from_slice(&second.encode().unwrap());
        (first, second, stream)
    }

    #[test]
    fn test_decode_all_at_once() {
        let (first, second, stream) = two_frames();
        let mut decoder = FrameDecoder::new();
        decoder.extend(&stream);

        assert_eq!(decoder.decode_next().unwrap(), Some(first));
        assert_eq!(decoder.decode_next().unwrap(), Some(second));
        assert_eq!(decoder.decode_next().unwrap(), None);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decode_byte_at_a_time() {
        let (first, second, stream) = two_frames();
        let mut decoder = FrameDecoder::new();
        let mut decoded = Vec::new();

        for byte in stream {
            decoder.extend(&[byte]);
            while let Some(message) = decoder.decode_next().unwrap() {
                decoded.push(message);
            }
        }

        assert_eq!(decoded, vec![first, second]);
    }

    #[test]
    fn test_oversize_length_rejected_before_payload() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&((MAX_MESSAGE_SIZE as u32) + 1).to_be_bytes());
        assert!(matches!(
            decoder.decode_next(),
            Err(ProtocolError::MessageTooLarge(_))
        ));
    }

    #[test]
    fn test_short_length_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&[0, 0, 0, 2, 0xaa, 0xbb]);
        assert_eq!(decoder.decode_next(), Err(ProtocolError::InvalidLength(2)));
    }
}
