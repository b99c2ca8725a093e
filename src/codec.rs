//! Streaming decoder for accumulating partial reads.
//!
//! There is no length prefix on the wire; message boundaries come entirely
//! from MessagePack's self-describing encoding. The decoder appends each
//! chunk to an internal `BytesMut`, extracts every complete message, and
//! keeps any trailing partial message for the next feed.
//!
//! "Not enough bytes yet" and "malformed bytes" are different outcomes:
//! the former returns the messages decoded so far, the latter is a
//! [`CrosscallError::Protocol`] the caller must treat as terminal.

use std::io::Cursor;

use bytes::{Buf, BytesMut};

use crate::error::{CrosscallError, Result};
use crate::message::Message;

/// Stateful feeder turning raw byte chunks into protocol messages.
pub struct MessageDecoder {
    /// Accumulated bytes from socket reads.
    buf: BytesMut,
}

impl MessageDecoder {
    /// Create a new decoder with an empty buffer.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(32 * 1024),
        }
    }

    /// Push a chunk of bytes and extract all complete messages.
    ///
    /// Returns the messages whose encoding completed within the buffered
    /// bytes, in stream order. A trailing partial message is retained
    /// internally and completes on a later feed.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the buffered bytes are not valid
    /// MessagePack or a decoded value is not a valid message shape. The
    /// decoder is in an undefined position afterwards; the connection
    /// must be torn down.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Message>> {
        self.buf.extend_from_slice(data);

        let mut messages = Vec::new();
        loop {
            if self.buf.is_empty() {
                break;
            }
            let mut cursor = Cursor::new(&self.buf[..]);
            match rmpv::decode::read_value(&mut cursor) {
                Ok(value) => {
                    let consumed = cursor.position() as usize;
                    self.buf.advance(consumed);
                    messages.push(Message::from_value(value)?);
                }
                Err(ref e) if is_incomplete(e) => break,
                Err(e) => {
                    return Err(CrosscallError::Protocol(format!(
                        "malformed msgpack stream: {}",
                        e
                    )))
                }
            }
        }
        Ok(messages)
    }

    /// Number of buffered bytes not yet forming a complete message.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

impl Default for MessageDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// A decode failure caused by running out of bytes mid-value means the
/// message is still in flight, not that the stream is broken.
#[allow(unreachable_patterns)]
fn is_incomplete(err: &rmpv::decode::Error) -> bool {
    match err {
        rmpv::decode::Error::InvalidMarkerRead(io)
        | rmpv::decode::Error::InvalidDataRead(io) => {
            io.kind() == std::io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmpv::Value;

    fn request(id: u32) -> Message {
        Message::Request {
            id,
            method: "echo".into(),
            params: vec![Value::from("hello")],
        }
    }

    #[test]
    fn single_complete_message() {
        let mut decoder = MessageDecoder::new();
        let bytes = request(1).to_bytes().unwrap();

        let messages = decoder.feed(&bytes).unwrap();
        assert_eq!(messages, vec![request(1)]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn multiple_messages_in_one_chunk() {
        let mut decoder = MessageDecoder::new();
        let mut bytes = Vec::new();
        for id in 1..=3 {
            bytes.extend(request(id).to_bytes().unwrap());
        }

        let messages = decoder.feed(&bytes).unwrap();
        assert_eq!(messages, vec![request(1), request(2), request(3)]);
    }

    #[test]
    fn partial_message_is_retained() {
        let mut decoder = MessageDecoder::new();
        let bytes = request(9).to_bytes().unwrap();
        let split = bytes.len() / 2;

        let messages = decoder.feed(&bytes[..split]).unwrap();
        assert!(messages.is_empty());
        assert_eq!(decoder.buffered(), split);

        let messages = decoder.feed(&bytes[split..]).unwrap();
        assert_eq!(messages, vec![request(9)]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn byte_at_a_time() {
        let mut decoder = MessageDecoder::new();
        let bytes = request(5).to_bytes().unwrap();

        let mut all = Vec::new();
        for byte in &bytes {
            all.extend(decoder.feed(&[*byte]).unwrap());
        }
        assert_eq!(all, vec![request(5)]);
    }

    #[test]
    fn complete_plus_partial() {
        let mut decoder = MessageDecoder::new();
        let first = request(1).to_bytes().unwrap();
        let second = request(2).to_bytes().unwrap();

        let mut chunk = first.clone();
        chunk.extend_from_slice(&second[..3]);

        let messages = decoder.feed(&chunk).unwrap();
        assert_eq!(messages, vec![request(1)]);

        let messages = decoder.feed(&second[3..]).unwrap();
        assert_eq!(messages, vec![request(2)]);
    }

    #[test]
    fn reserved_marker_is_a_framing_error() {
        let mut decoder = MessageDecoder::new();
        // 0xc1 is the one marker MessagePack never uses.
        let err = decoder.feed(&[0xc1]).unwrap_err();
        assert!(matches!(err, CrosscallError::Protocol(_)));
    }

    #[test]
    fn valid_msgpack_invalid_shape_is_a_framing_error() {
        let mut decoder = MessageDecoder::new();
        let mut bytes = Vec::new();
        rmpv::encode::write_value(&mut bytes, &Value::from("just a string")).unwrap();

        let err = decoder.feed(&bytes).unwrap_err();
        assert!(matches!(err, CrosscallError::Protocol(_)));
    }

    #[test]
    fn empty_feed_is_fine() {
        let mut decoder = MessageDecoder::new();
        assert!(decoder.feed(&[]).unwrap().is_empty());
    }
}
