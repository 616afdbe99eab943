//! Request and reply frames.
//!
//! # Wire shapes
//!
//! Every frame is a single value of the connection's [`ValueCodec`]:
//!
//! ```text
//! Request     Struct[ String(name), args | None ]
//! ReplyOk     Struct[ Int(1),       value | None ]
//! ReplyError  Struct[ Int(0),       String(message) ]
//! ```
//!
//! There is no length prefix. A frame is one `write(2)` on the sender side and
//! one grow-read on the receiving side (see [`crate::sys::ReceiveBuffer`]).
//!
//! # Sizing
//!
//! Encoders write into a zero-filled buffer of fixed capacity, so each builder
//! first computes an upper bound: the payload size plus [`FRAME_PAD`]. The
//! whole buffer is sent, trailing zeros included; decoders read one value off
//! the front and ignore the rest.

use crate::value::{CodecError, Value, ValueCodec};

/// Reply code for a successful reply.
pub const CODE_OK: i32 = 1;

/// Reply code for an error reply.
pub const CODE_ERROR: i32 = 0;

/// Fixed slack added to every size estimate to cover frame headers.
pub const FRAME_PAD: usize = 128;

/// Size assumed for an absent value.
const NONE_SIZE: usize = 8;

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A named request.
    Request {
        /// Handler name.
        name: String,
        /// Arguments, [`Value::None`] when absent.
        args: Value,
    },
    /// A successful reply.
    ReplyOk(Value),
    /// An error reply with its message.
    ReplyError(String),
}

impl Frame {
    /// Classify `bytes` as one of the three frame shapes.
    pub fn decode(codec: &dyn ValueCodec, bytes: &[u8]) -> Option<Self> {
        let (value, _) = codec.decode(bytes).ok()?;
        let Value::Struct(mut fields) = value else {
            return None;
        };
        if fields.len() != 2 {
            return None;
        }
        let second = fields.pop()?;
        let first = fields.pop()?;
        match (first, second) {
            (Value::String(name), args) => Some(Self::Request { name, args }),
            (Value::Int(CODE_OK), value) => Some(Self::ReplyOk(value)),
            (Value::Int(CODE_ERROR), Value::String(msg)) => Some(Self::ReplyError(msg)),
            _ => None,
        }
    }

    /// Encode this frame with its size estimate.
    pub fn encode(&self, codec: &dyn ValueCodec) -> Result<Vec<u8>, CodecError> {
        match self {
            Self::Request { name, args } => build_request(codec, name, args),
            Self::ReplyOk(value) => build_reply_ok(codec, value),
            Self::ReplyError(msg) => build_reply_error(codec, msg),
        }
    }
}

fn optional_size(codec: &dyn ValueCodec, value: &Value) -> usize {
    if value.is_none() {
        NONE_SIZE
    } else {
        codec.size(value)
    }
}

fn build(codec: &dyn ValueCodec, capacity: usize, frame: &Value) -> Result<Vec<u8>, CodecError> {
    let mut buf = vec![0u8; capacity];
    codec.encode(frame, &mut buf)?;
    Ok(buf)
}

fn first_two(codec: &dyn ValueCodec, bytes: &[u8]) -> Option<(Value, Value)> {
    let (value, _) = codec.decode(bytes).ok()?;
    match value {
        Value::Struct(fields) if fields.len() == 2 => {
            let mut it = fields.into_iter();
            Some((it.next()?, it.next()?))
        }
        _ => None,
    }
}

// ─── Request ───────────────────────────────────────────────────────────────

/// Upper bound on the encoded size of a request.
pub fn request_size(codec: &dyn ValueCodec, name: &str, args: &Value) -> usize {
    name.len() + optional_size(codec, args) + FRAME_PAD
}

/// Encode a request for handler `name`.
pub fn build_request(
    codec: &dyn ValueCodec,
    name: &str,
    args: &Value,
) -> Result<Vec<u8>, CodecError> {
    let frame = Value::Struct(vec![Value::String(name.to_owned()), args.clone()]);
    build(codec, request_size(codec, name, args), &frame)
}

/// Decode a request into its name and arguments.
pub fn parse_request(codec: &dyn ValueCodec, bytes: &[u8]) -> Option<(String, Value)> {
    match first_two(codec, bytes)? {
        (Value::String(name), args) => Some((name, args)),
        _ => None,
    }
}

// ─── Replies ───────────────────────────────────────────────────────────────

/// Upper bound on the encoded size of a successful reply.
pub fn reply_ok_size(codec: &dyn ValueCodec, value: &Value) -> usize {
    optional_size(codec, value) + FRAME_PAD
}

/// Encode a successful reply carrying `value`.
pub fn build_reply_ok(codec: &dyn ValueCodec, value: &Value) -> Result<Vec<u8>, CodecError> {
    let frame = Value::Struct(vec![Value::Int(CODE_OK), value.clone()]);
    build(codec, reply_ok_size(codec, value), &frame)
}

/// Upper bound on the encoded size of an error reply.
pub fn reply_error_size(msg: &str) -> usize {
    msg.len() + FRAME_PAD
}

/// Encode an error reply carrying `msg`.
pub fn build_reply_error(codec: &dyn ValueCodec, msg: &str) -> Result<Vec<u8>, CodecError> {
    let frame = Value::Struct(vec![Value::Int(CODE_ERROR), Value::String(msg.to_owned())]);
    build(codec, reply_error_size(msg), &frame)
}

/// True if `bytes` starts with a struct whose first field is `Int(1)`.
pub fn is_reply_ok(codec: &dyn ValueCodec, bytes: &[u8]) -> bool {
    matches!(first_two(codec, bytes), Some((Value::Int(CODE_OK), _)))
}

/// True if `bytes` starts with a struct whose first field is `Int(0)`.
pub fn is_reply_error(codec: &dyn ValueCodec, bytes: &[u8]) -> bool {
    matches!(first_two(codec, bytes), Some((Value::Int(CODE_ERROR), _)))
}

/// The value carried by a successful reply.
pub fn parse_reply_ok(codec: &dyn ValueCodec, bytes: &[u8]) -> Option<Value> {
    match first_two(codec, bytes)? {
        (Value::Int(CODE_OK), value) => Some(value),
        _ => None,
    }
}

/// The message carried by an error reply.
pub fn parse_reply_error(codec: &dyn ValueCodec, bytes: &[u8]) -> Option<String> {
    match first_two(codec, bytes)? {
        (Value::Int(CODE_ERROR), Value::String(msg)) => Some(msg),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::PodCodec;

    #[test]
    fn test_request_with_and_without_args() {
        let codec = PodCodec;
        let bytes = build_request(&codec, "ping", &Value::None).unwrap();
        assert_eq!(bytes.len(), request_size(&codec, "ping", &Value::None));
        assert_eq!(
            parse_request(&codec, &bytes),
            Some(("ping".to_string(), Value::None))
        );

        let args = Value::Struct(vec![Value::Int(7), Value::from("x")]);
        let bytes = build_request(&codec, "set", &args).unwrap();
        let parsed = parse_request(&codec, &bytes);
        assert_eq!(parsed, Some(("set".to_string(), args)));
    }

    #[test]
    fn test_reply_ok_frames() {
        let codec = PodCodec;
        let bytes = build_reply_ok(&codec, &Value::Int(42)).unwrap();
        assert!(is_reply_ok(&codec, &bytes));
        assert!(!is_reply_error(&codec, &bytes));
        assert_eq!(parse_reply_ok(&codec, &bytes), Some(Value::Int(42)));

        let bytes = build_reply_ok(&codec, &Value::None).unwrap();
        assert_eq!(parse_reply_ok(&codec, &bytes), Some(Value::None));
    }

    #[test]
    fn test_reply_error_frames() {
        let codec = PodCodec;
        let bytes = build_reply_error(&codec, "nope").unwrap();
        assert!(is_reply_error(&codec, &bytes));
        assert!(!is_reply_ok(&codec, &bytes));
        assert_eq!(parse_reply_error(&codec, &bytes), Some("nope".to_string()));
        assert_eq!(parse_reply_ok(&codec, &bytes), None);

        let bytes = build_reply_error(&codec, "").unwrap();
        assert_eq!(parse_reply_error(&codec, &bytes), Some(String::new()));
    }

    #[test]
    fn test_size_estimates_cover_encoding() {
        let codec = PodCodec;
        let big = Value::Struct((0..50).map(Value::Int).collect());
        let frame = Value::Struct(vec![Value::from("n"), big.clone()]);
        assert!(request_size(&codec, "n", &big) >= codec.size(&frame));
        assert!(build_request(&codec, "n", &big).is_ok());
        assert!(build_reply_ok(&codec, &big).is_ok());
        let msg = "e".repeat(1000);
        assert!(build_reply_error(&codec, &msg).is_ok());
    }

    #[test]
    fn test_frame_decode_classifies() {
        let codec = PodCodec;
        let cases = [
            Frame::Request {
                name: "ping".into(),
                args: Value::None,
            },
            Frame::Request {
                name: "echo".into(),
                args: Value::from("hi"),
            },
            Frame::ReplyOk(Value::None),
            Frame::ReplyOk(Value::Long(-1)),
            Frame::ReplyError("boom".into()),
        ];
        for frame in cases {
            let bytes = frame.encode(&codec).unwrap();
            assert_eq!(Frame::decode(&codec, &bytes), Some(frame));
        }
    }

    #[test]
    fn test_garbage_is_not_a_frame() {
        let codec = PodCodec;
        assert_eq!(Frame::decode(&codec, b"hello world"), None);
        assert_eq!(parse_request(&codec, &[0u8; 16]), None);
        assert!(!is_reply_ok(&codec, &[]));

        let reply = build_reply_ok(&codec, &Value::Int(1)).unwrap();
        assert_eq!(parse_request(&codec, &reply), None);

        let bytes = build_request(&codec, "ping", &Value::None).unwrap();
        assert_eq!(parse_request(&codec, &bytes[..12]), None);
    }

    #[test]
    fn test_reply_code_with_wrong_shape_is_rejected() {
        let codec = PodCodec;
        let frame = Value::Struct(vec![Value::Int(CODE_ERROR), Value::Int(5)]);
        let mut buf = vec![0u8; codec.size(&frame)];
        codec.encode(&frame, &mut buf).unwrap();
        assert!(is_reply_error(&codec, &buf));
        assert_eq!(parse_reply_error(&codec, &buf), None);
        assert_eq!(Frame::decode(&codec, &buf), None);
    }
}
