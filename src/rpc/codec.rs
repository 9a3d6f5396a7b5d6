//! Msgpack framing for the RPC envelope.
//!
//! Every message is a single msgpack array whose first element is a type tag:
//!
//! ```text
//! [0, id, method, args]       request
//! [1, id, error, result]      response
//! [2, method, args]           notification
//! ```
//!
//! msgpack is self-delimiting, so there is no length header: the decoder
//! buffers bytes until one complete value can be read.

use rmpv::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{value_to_text, SessionError};

/// Maximum size of one encoded message (100MB) to prevent OOM from a buggy peer.
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

const REQUEST_TAG: u64 = 0;
const RESPONSE_TAG: u64 = 1;
const NOTIFICATION_TAG: u64 = 2;

/// Errors produced while encoding or decoding the envelope.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Leading tag is not 0, 1 or 2.
    #[error("unknown message type {0}")]
    UnknownType(u64),

    /// The value is not a well-formed envelope.
    #[error("invalid message: {0}")]
    Invalid(String),

    /// The bytes are not valid msgpack.
    #[error("msgpack decode failed: {0}")]
    Decode(String),

    /// Encoding a value failed.
    #[error("msgpack encode failed: {0}")]
    Encode(String),

    /// A message exceeded the configured size limit.
    #[error("message size {size} exceeds maximum {max} bytes")]
    TooLarge {
        /// Bytes buffered so far.
        size: usize,
        /// Configured limit.
        max: usize,
    },
}

impl From<CodecError> for SessionError {
    fn from(err: CodecError) -> Self {
        SessionError::Framing(err.to_string())
    }
}

/// One decoded RPC message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A call that expects exactly one Response with the same id.
    Request {
        id: u64,
        method: String,
        args: Vec<Value>,
    },
    /// Answer to a previous Request.
    Response {
        id: u64,
        error: Option<Value>,
        result: Value,
    },
    /// Fire-and-forget event.
    Notification { method: String, args: Vec<Value> },
}

impl Message {
    /// Build the wire array for this message.
    pub fn to_value(&self) -> Value {
        match self {
            Message::Request { id, method, args } => Value::Array(vec![
                Value::from(REQUEST_TAG),
                Value::from(*id),
                Value::from(method.as_str()),
                Value::Array(args.clone()),
            ]),
            Message::Response { id, error, result } => Value::Array(vec![
                Value::from(RESPONSE_TAG),
                Value::from(*id),
                error.clone().unwrap_or(Value::Nil),
                result.clone(),
            ]),
            Message::Notification { method, args } => Value::Array(vec![
                Value::from(NOTIFICATION_TAG),
                Value::from(method.as_str()),
                Value::Array(args.clone()),
            ]),
        }
    }

    /// Classify a decoded wire value.
    pub fn from_value(value: Value) -> Result<Self, CodecError> {
        let items = match value {
            Value::Array(items) => items,
            other => {
                return Err(CodecError::Invalid(format!(
                    "expected array, got {}",
                    other
                )))
            }
        };

        let tag = items
            .first()
            .and_then(Value::as_u64)
            .ok_or_else(|| CodecError::Invalid("missing integer type tag".to_string()))?;

        let mut fields = items.into_iter().skip(1);
        match tag {
            REQUEST_TAG => {
                expect_len(tag, fields.len(), 3)?;
                let id = take_id(fields.next())?;
                let method = take_method(fields.next())?;
                let args = take_args(fields.next())?;
                Ok(Message::Request { id, method, args })
            }
            RESPONSE_TAG => {
                expect_len(tag, fields.len(), 3)?;
                let id = take_id(fields.next())?;
                let error = match fields.next() {
                    Some(Value::Nil) | None => None,
                    Some(err) => Some(err),
                };
                let result = fields.next().unwrap_or(Value::Nil);
                Ok(Message::Response { id, error, result })
            }
            NOTIFICATION_TAG => {
                expect_len(tag, fields.len(), 2)?;
                let method = take_method(fields.next())?;
                let args = take_args(fields.next())?;
                Ok(Message::Notification { method, args })
            }
            other => Err(CodecError::UnknownType(other)),
        }
    }

    /// Serialize to msgpack bytes.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &self.to_value())
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(buf)
    }

    /// Method name for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request { method, .. } | Message::Notification { method, .. } => {
                Some(method)
            }
            Message::Response { .. } => None,
        }
    }
}

fn expect_len(tag: u64, actual: usize, expected: usize) -> Result<(), CodecError> {
    if actual == expected {
        Ok(())
    } else {
        Err(CodecError::Invalid(format!(
            "message type {} needs {} elements, got {}",
            tag,
            expected + 1,
            actual + 1
        )))
    }
}

fn take_id(value: Option<Value>) -> Result<u64, CodecError> {
    value
        .as_ref()
        .and_then(Value::as_u64)
        .ok_or_else(|| CodecError::Invalid("message id must be an unsigned integer".to_string()))
}

fn take_method(value: Option<Value>) -> Result<String, CodecError> {
    match value {
        Some(v @ Value::String(_)) | Some(v @ Value::Binary(_)) => Ok(value_to_text(&v)),
        _ => Err(CodecError::Invalid(
            "method name must be a string".to_string(),
        )),
    }
}

fn take_args(value: Option<Value>) -> Result<Vec<Value>, CodecError> {
    match value {
        Some(Value::Array(args)) => Ok(args),
        _ => Err(CodecError::Invalid("arguments must be an array".to_string())),
    }
}

/// Incremental decoder that turns a byte stream into messages.
///
/// Bytes that do not yet form a complete value stay buffered until the next
/// `feed`, so a message split across reads is decoded once it is whole.
/// The extent of the leading value is tracked across feeds by walking msgpack
/// headers, so each byte is scanned once and the value is decoded once.
#[derive(Debug)]
pub struct MessageDecoder {
    buf: Vec<u8>,
    max_message_size: usize,
    /// Bytes of the leading value already walked.
    scanned: usize,
    /// Values still to walk before the leading one is complete. Zero when no
    /// walk is in progress.
    open_items: usize,
}

impl Default for MessageDecoder {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_SIZE)
    }
}

impl MessageDecoder {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_message_size,
            scanned: 0,
            open_items: 0,
        }
    }

    /// Append raw bytes read from the transport.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Decode the next complete message, or `Ok(None)` if more bytes are needed.
    pub fn next_message(&mut self) -> Result<Option<Message>, CodecError> {
        if self.buf.is_empty() {
            return Ok(None);
        }

        let Some(len) = self.scan()? else {
            return Ok(None);
        };
        let mut bytes = &self.buf[..len];
        let value =
            rmpv::decode::read_value(&mut bytes).map_err(|e| CodecError::Decode(e.to_string()))?;
        self.buf.drain(..len);
        self.scanned = 0;
        self.open_items = 0;
        Message::from_value(value).map(Some)
    }

    /// Walk headers of the leading value, resuming where the last call stopped.
    ///
    /// Returns the value's encoded length once all of it is buffered.
    fn scan(&mut self) -> Result<Option<usize>, CodecError> {
        if self.open_items == 0 {
            self.scanned = 0;
            self.open_items = 1;
        }

        while self.open_items > 0 {
            let Some(item) = item_header(&self.buf[self.scanned..])? else {
                return Ok(None);
            };
            let end = self.scanned.saturating_add(item.len);
            if end > self.max_message_size {
                return Err(CodecError::TooLarge {
                    size: end,
                    max: self.max_message_size,
                });
            }
            if end > self.buf.len() {
                return Ok(None);
            }
            self.scanned = end;
            self.open_items = (self.open_items - 1).saturating_add(item.children);
        }
        Ok(Some(self.scanned))
    }
}

/// Encoded size of one msgpack item, excluding nested items, and how many
/// nested items follow it.
struct ItemHeader {
    len: usize,
    children: usize,
}

impl ItemHeader {
    fn scalar(len: usize) -> Self {
        Self { len, children: 0 }
    }
}

/// Parse the header at the start of `bytes`; `None` if it is cut short.
fn item_header(bytes: &[u8]) -> Result<Option<ItemHeader>, CodecError> {
    let Some(&marker) = bytes.first() else {
        return Ok(None);
    };
    // Big-endian length field of `width` bytes right after the marker.
    let field = |width: usize| -> Option<usize> {
        bytes
            .get(1..1 + width)
            .map(|b| b.iter().fold(0usize, |acc, &byte| (acc << 8) | byte as usize))
    };
    let sized = |width: usize, extra: usize| {
        field(width).map(|n| ItemHeader::scalar((1 + width + extra).saturating_add(n)))
    };
    let nested = |width: usize, per_entry: usize| {
        field(width).map(|n| ItemHeader {
            len: 1 + width,
            children: n.saturating_mul(per_entry),
        })
    };

    let header = match marker {
        0x00..=0x7f | 0xe0..=0xff | 0xc0 | 0xc2 | 0xc3 => Some(ItemHeader::scalar(1)),
        0x80..=0x8f => Some(ItemHeader {
            len: 1,
            children: 2 * (marker & 0x0f) as usize,
        }),
        0x90..=0x9f => Some(ItemHeader {
            len: 1,
            children: (marker & 0x0f) as usize,
        }),
        0xa0..=0xbf => Some(ItemHeader::scalar(1 + (marker & 0x1f) as usize)),
        0xcc | 0xd0 => Some(ItemHeader::scalar(2)),
        0xcd | 0xd1 => Some(ItemHeader::scalar(3)),
        0xca | 0xce | 0xd2 => Some(ItemHeader::scalar(5)),
        0xcb | 0xcf | 0xd3 => Some(ItemHeader::scalar(9)),
        // fixext: marker, type, data
        0xd4 => Some(ItemHeader::scalar(3)),
        0xd5 => Some(ItemHeader::scalar(4)),
        0xd6 => Some(ItemHeader::scalar(6)),
        0xd7 => Some(ItemHeader::scalar(10)),
        0xd8 => Some(ItemHeader::scalar(18)),
        0xc4 | 0xd9 => sized(1, 0),
        0xc5 | 0xda => sized(2, 0),
        0xc6 | 0xdb => sized(4, 0),
        0xc7 => sized(1, 1),
        0xc8 => sized(2, 1),
        0xc9 => sized(4, 1),
        0xdc => nested(2, 1),
        0xdd => nested(4, 1),
        0xde => nested(2, 2),
        0xdf => nested(4, 2),
        0xc1 => return Err(CodecError::Decode("reserved marker 0xc1".to_string())),
    };
    Ok(header)
}

/// Read one message from a stream, buffering partial data in `decoder`.
///
/// # Errors
///
/// Returns `SessionError::Eof` if the stream closes before a complete
/// message, or `SessionError::Framing` for malformed data.
pub async fn read_message<R>(
    reader: &mut R,
    decoder: &mut MessageDecoder,
) -> Result<Message, SessionError>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; 8192];
    loop {
        if let Some(message) = decoder.next_message()? {
            return Ok(message);
        }
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(SessionError::Eof);
        }
        decoder.feed(&chunk[..n]);
    }
}

/// Encode and write one message, then flush.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = message.encode()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    /// Test timeout to prevent hanging tests.
    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    fn raw(value: Value) -> Vec<u8> {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &value).unwrap();
        buf
    }

    #[test]
    fn test_request_wire_shape() {
        let msg = Message::Request {
            id: 1,
            method: "echo".to_string(),
            args: vec![Value::from("hi")],
        };
        assert_eq!(
            msg.to_value(),
            Value::Array(vec![
                Value::from(0),
                Value::from(1),
                Value::from("echo"),
                Value::Array(vec![Value::from("hi")]),
            ])
        );
    }

    #[test]
    fn test_response_nil_error_is_none() {
        let value = Value::Array(vec![
            Value::from(1),
            Value::from(7),
            Value::Nil,
            Value::from("ok"),
        ]);
        assert_eq!(
            Message::from_value(value).unwrap(),
            Message::Response {
                id: 7,
                error: None,
                result: Value::from("ok"),
            }
        );
    }

    #[test]
    fn test_response_with_error() {
        let value = Value::Array(vec![
            Value::from(1),
            Value::from(3),
            Value::Array(vec![Value::from(0), Value::from("bad")]),
            Value::Nil,
        ]);
        match Message::from_value(value).unwrap() {
            Message::Response { id, error, result } => {
                assert_eq!(id, 3);
                assert!(error.is_some());
                assert_eq!(result, Value::Nil);
            }
            other => panic!("Expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_binary_method_name_is_decoded() {
        let value = Value::Array(vec![
            Value::from(2),
            Value::Binary(b"redraw".to_vec()),
            Value::Array(vec![]),
        ]);
        let msg = Message::from_value(value).unwrap();
        assert_eq!(msg.method(), Some("redraw"));
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let value = Value::Array(vec![Value::from(5), Value::from("x"), Value::Array(vec![])]);
        assert!(matches!(
            Message::from_value(value),
            Err(CodecError::UnknownType(5))
        ));
    }

    #[test]
    fn test_malformed_shapes_rejected() {
        // Wrong arity
        let short = Value::Array(vec![Value::from(0), Value::from(1), Value::from("m")]);
        assert!(matches!(
            Message::from_value(short),
            Err(CodecError::Invalid(_))
        ));

        // Not an array
        assert!(Message::from_value(Value::from("hello")).is_err());

        // Negative id
        let neg = Value::Array(vec![
            Value::from(0),
            Value::from(-1),
            Value::from("m"),
            Value::Array(vec![]),
        ]);
        assert!(Message::from_value(neg).is_err());

        // Args not an array
        let args = Value::Array(vec![Value::from(2), Value::from("m"), Value::from(1)]);
        assert!(Message::from_value(args).is_err());
    }

    #[test]
    fn test_decoder_handles_split_and_batched_input() {
        let first = Message::Notification {
            method: "a".to_string(),
            args: vec![Value::from(1)],
        };
        let second = Message::Request {
            id: 9,
            method: "b".to_string(),
            args: vec![],
        };
        let mut bytes = first.encode().unwrap();
        bytes.extend(second.encode().unwrap());

        let mut decoder = MessageDecoder::default();
        let split = 3;
        decoder.feed(&bytes[..split]);
        assert_eq!(decoder.next_message().unwrap(), None);

        decoder.feed(&bytes[split..]);
        assert_eq!(decoder.next_message().unwrap(), Some(first));
        assert_eq!(decoder.next_message().unwrap(), Some(second));
        assert_eq!(decoder.next_message().unwrap(), None);
    }

    #[test]
    fn test_decoder_resumes_across_many_small_reads() {
        let msg = Message::Request {
            id: 3,
            method: "put".to_string(),
            args: vec![
                Value::Binary(vec![7; 300]),
                Value::Map(vec![(Value::from("k"), Value::Array(vec![Value::from(-1); 20]))]),
                Value::from(1.5),
                Value::Ext(4, vec![1, 2, 3]),
            ],
        };
        let bytes = msg.encode().unwrap();

        let mut decoder = MessageDecoder::default();
        for byte in &bytes[..bytes.len() - 1] {
            decoder.feed(std::slice::from_ref(byte));
            assert_eq!(decoder.next_message().unwrap(), None);
        }
        decoder.feed(&bytes[bytes.len() - 1..]);
        assert_eq!(decoder.next_message().unwrap(), Some(msg));
        assert_eq!(decoder.next_message().unwrap(), None);
    }

    #[test]
    fn test_decoder_rejects_oversized_header_early() {
        let mut decoder = MessageDecoder::new(1024);
        // str32 claiming 1 MiB, with only the header present
        decoder.feed(&[0x93, 0x02, 0xdb, 0x00, 0x10, 0x00, 0x00]);
        assert!(matches!(
            decoder.next_message(),
            Err(CodecError::TooLarge { max: 1024, .. })
        ));
    }

    #[test]
    fn test_decoder_rejects_reserved_marker() {
        let mut decoder = MessageDecoder::default();
        decoder.feed(&[0x93, 0xc1]);
        assert!(matches!(decoder.next_message(), Err(CodecError::Decode(_))));
    }

    #[test]
    fn test_decoder_rejects_oversized_message() {
        let mut decoder = MessageDecoder::new(16);
        let big = raw(Value::Array(vec![
            Value::from(2),
            Value::from("m"),
            Value::Array(vec![Value::from("x".repeat(64))]),
        ]));
        decoder.feed(&big);
        assert!(matches!(
            decoder.next_message(),
            Err(CodecError::TooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_write_read_roundtrip_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let msg = Message::Notification {
            method: "event".to_string(),
            args: vec![Value::from(true)],
        };

        write_message(&mut client, &msg).await.expect("Write failed");

        let mut decoder = MessageDecoder::default();
        let received = timeout(TEST_TIMEOUT, read_message(&mut server, &mut decoder))
            .await
            .expect("Test timed out")
            .expect("Read failed");
        assert_eq!(received, msg);
    }

    #[tokio::test]
    async fn test_connection_closed_returns_eof() {
        let (client, mut server) = tokio::io::duplex(1024);
        drop(client);

        let mut decoder = MessageDecoder::default();
        let result = timeout(TEST_TIMEOUT, read_message(&mut server, &mut decoder))
            .await
            .expect("Test timed out");
        assert!(matches!(result, Err(SessionError::Eof)));
    }
}
