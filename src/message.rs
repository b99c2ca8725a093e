//! Wire-level message types for the MessagePack-RPC protocol.
//!
//! Every message on the stream is a MessagePack array whose first element
//! is the type tag:
//!
//! - Request: `[0, msgid, method, params]`
//! - Response: `[1, msgid, error, result]`
//! - Notification: `[2, method, params]`
//!
//! Decoding inspects the tag and the array length before anything else;
//! any other shape is a protocol error, never silently skipped.

use rmpv::Value;

use crate::error::{CrosscallError, Result};

/// Type tag for a request message.
pub const TYPE_REQUEST: u64 = 0;
/// Type tag for a response message.
pub const TYPE_RESPONSE: u64 = 1;
/// Type tag for a notification message.
pub const TYPE_NOTIFICATION: u64 = 2;

/// A single decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A call expecting a matching [`Message::Response`] with the same id.
    Request {
        id: u32,
        method: String,
        params: Vec<Value>,
    },
    /// The reply to a request. `error` carries the remote error string when
    /// the call failed; `result` is meaningful only when `error` is `None`.
    Response {
        id: u32,
        error: Option<String>,
        result: Value,
    },
    /// A one-way message with no reply and no correlation id.
    Notification { method: String, params: Vec<Value> },
}

impl Message {
    /// Short name of the message kind, for log and error text.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Request { .. } => "request",
            Message::Response { .. } => "response",
            Message::Notification { .. } => "notification",
        }
    }

    /// Build the MessagePack value representation of this message.
    pub fn to_value(&self) -> Value {
        match self {
            Message::Request { id, method, params } => Value::Array(vec![
                Value::from(TYPE_REQUEST),
                Value::from(*id),
                Value::from(method.as_str()),
                Value::Array(params.clone()),
            ]),
            Message::Response { id, error, result } => Value::Array(vec![
                Value::from(TYPE_RESPONSE),
                Value::from(*id),
                match error {
                    Some(e) => Value::from(e.as_str()),
                    None => Value::Nil,
                },
                result.clone(),
            ]),
            Message::Notification { method, params } => Value::Array(vec![
                Value::from(TYPE_NOTIFICATION),
                Value::from(method.as_str()),
                Value::Array(params.clone()),
            ]),
        }
    }

    /// Encode this message to its exact wire bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &self.to_value())?;
        Ok(buf)
    }

    /// Interpret a decoded MessagePack value as a protocol message.
    ///
    /// Checks the discriminant and array length first, then the individual
    /// field types. Anything that does not match one of the three shapes is
    /// a framing violation.
    pub fn from_value(value: Value) -> Result<Message> {
        let items = match value {
            Value::Array(items) => items,
            other => {
                return Err(CrosscallError::Protocol(format!(
                    "message is not an array: {}",
                    other
                )))
            }
        };
        let tag = items
            .first()
            .and_then(|v| v.as_u64())
            .ok_or_else(|| CrosscallError::Protocol("missing message type tag".into()))?;

        match (tag, items.len()) {
            (TYPE_REQUEST, 4) => {
                let mut it = items.into_iter().skip(1);
                let id = decode_msgid(it.next().unwrap())?;
                let method = decode_method(it.next().unwrap())?;
                let params = decode_params(it.next().unwrap())?;
                Ok(Message::Request { id, method, params })
            }
            (TYPE_RESPONSE, 4) => {
                let mut it = items.into_iter().skip(1);
                let id = decode_msgid(it.next().unwrap())?;
                let error = match it.next().unwrap() {
                    Value::Nil => None,
                    Value::String(s) if s.is_str() => s.into_str(),
                    // Other peers may put arbitrary values in the error
                    // slot, including non-UTF-8 bytes; keep them readable
                    // rather than rejecting or blanking them.
                    other => Some(other.to_string()),
                };
                let result = it.next().unwrap();
                Ok(Message::Response { id, error, result })
            }
            (TYPE_NOTIFICATION, 3) => {
                let mut it = items.into_iter().skip(1);
                let method = decode_method(it.next().unwrap())?;
                let params = decode_params(it.next().unwrap())?;
                Ok(Message::Notification { method, params })
            }
            (tag, len) => Err(CrosscallError::Protocol(format!(
                "invalid message shape: tag={}, len={}",
                tag, len
            ))),
        }
    }
}

fn decode_msgid(value: Value) -> Result<u32> {
    value
        .as_u64()
        .and_then(|id| u32::try_from(id).ok())
        .ok_or_else(|| CrosscallError::Protocol(format!("invalid msgid: {}", value)))
}

fn decode_method(value: Value) -> Result<String> {
    match value {
        Value::String(s) => s
            .into_str()
            .ok_or_else(|| CrosscallError::Protocol("method name is not utf-8".into())),
        other => Err(CrosscallError::Protocol(format!(
            "method name is not a string: {}",
            other
        ))),
    }
}

fn decode_params(value: Value) -> Result<Vec<Value>> {
    match value {
        Value::Array(params) => Ok(params),
        other => Err(CrosscallError::Protocol(format!(
            "params is not an array: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) {
        let bytes = msg.to_bytes().unwrap();
        let value = rmpv::decode::read_value(&mut &bytes[..]).unwrap();
        let decoded = Message::from_value(value).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn request_roundtrip() {
        roundtrip(Message::Request {
            id: 7,
            method: "echo".into(),
            params: vec![Value::from("hello"), Value::from(42)],
        });
    }

    #[test]
    fn response_roundtrip() {
        roundtrip(Message::Response {
            id: 7,
            error: None,
            result: Value::from("hi"),
        });
        roundtrip(Message::Response {
            id: 8,
            error: Some("boom".into()),
            result: Value::Nil,
        });
    }

    #[test]
    fn notification_roundtrip() {
        roundtrip(Message::Notification {
            method: "log".into(),
            params: vec![Value::from("line")],
        });
    }

    #[test]
    fn empty_params_roundtrip() {
        roundtrip(Message::Request {
            id: 1,
            method: "ping".into(),
            params: vec![],
        });
    }

    #[test]
    fn request_tag_is_zero_on_the_wire() {
        let msg = Message::Request {
            id: 1,
            method: "m".into(),
            params: vec![],
        };
        let bytes = msg.to_bytes().unwrap();
        // fixarray of 4 elements, then positive fixint 0.
        assert_eq!(bytes[0], 0x94);
        assert_eq!(bytes[1], 0x00);
    }

    #[test]
    fn notification_has_three_elements() {
        let msg = Message::Notification {
            method: "m".into(),
            params: vec![],
        };
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(bytes[0], 0x93);
        assert_eq!(bytes[1], 0x02);
    }

    #[test]
    fn rejects_non_array() {
        let err = Message::from_value(Value::from("nope")).unwrap_err();
        assert!(matches!(err, CrosscallError::Protocol(_)));
    }

    #[test]
    fn rejects_wrong_length() {
        // Request tag with only 3 elements.
        let value = Value::Array(vec![Value::from(0u32), Value::from(1u32), Value::from("m")]);
        assert!(Message::from_value(value).is_err());

        // Notification tag with 4 elements.
        let value = Value::Array(vec![
            Value::from(2u32),
            Value::from("m"),
            Value::Array(vec![]),
            Value::Nil,
        ]);
        assert!(Message::from_value(value).is_err());
    }

    #[test]
    fn rejects_unknown_tag() {
        let value = Value::Array(vec![
            Value::from(9u32),
            Value::from(1u32),
            Value::from("m"),
            Value::Array(vec![]),
        ]);
        assert!(Message::from_value(value).is_err());
    }

    #[test]
    fn rejects_non_string_method() {
        let value = Value::Array(vec![
            Value::from(0u32),
            Value::from(1u32),
            Value::from(5u32),
            Value::Array(vec![]),
        ]);
        assert!(Message::from_value(value).is_err());
    }

    #[test]
    fn rejects_non_array_params() {
        let value = Value::Array(vec![
            Value::from(0u32),
            Value::from(1u32),
            Value::from("m"),
            Value::from("not params"),
        ]);
        assert!(Message::from_value(value).is_err());
    }

    #[test]
    fn non_utf8_error_slot_stays_visible() {
        // [1, 3, <2-byte str that is not UTF-8>, nil]
        let raw = [0x94, 0x01, 0x03, 0xa2, 0xff, 0xfe, 0xc0];
        let value = rmpv::decode::read_value(&mut &raw[..]).unwrap();
        match Message::from_value(value).unwrap() {
            Message::Response { error, .. } => {
                let text = error.expect("error slot must survive");
                assert!(!text.is_empty());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn lenient_error_slot() {
        // A peer that puts a non-string value in the error slot still
        // produces a readable error, not a framing failure.
        let value = Value::Array(vec![
            Value::from(1u32),
            Value::from(3u32),
            Value::from(500u32),
            Value::Nil,
        ]);
        match Message::from_value(value).unwrap() {
            Message::Response { error, .. } => assert_eq!(error.as_deref(), Some("500")),
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
