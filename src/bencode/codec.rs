//! Incremental bencode codec for nREPL streams.
//!
//! Wraps a hand-rolled streaming parser in the [`tokio_util::codec`]
//! `Decoder`/`Encoder` traits so it can drive
//! [`tokio_util::codec::FramedRead`] (inbound) and
//! [`tokio_util::codec::FramedWrite`] (outbound).
//!
//! The decoder is restartable per chunk: a message boundary can fall
//! anywhere inside a read, so the parser keeps a stack of partially-built
//! containers across `decode` calls and consumes leaf tokens from the front
//! of the buffer as they complete. `Ok(None)` always means "needs more
//! bytes" — malformed input is reported as [`Error::Bencode`], never
//! silently truncated.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::bencode::Value;
use crate::{Error, Result};

/// Maximum accepted byte-string length: 16 MiB.
///
/// A length prefix above this limit fails decoding with [`Error::Bencode`]
/// before any allocation, protecting the client from a misbehaving server
/// claiming an absurd payload size.
pub const MAX_STRING_BYTES: usize = 16 * 1024 * 1024;

/// Maximum container nesting depth accepted by the decoder.
pub const MAX_DEPTH: usize = 32;

/// Longest representable integer token body: sign plus 19 digits.
const MAX_INT_DIGITS: usize = 20;

/// Longest accepted string length prefix, in digits.
const MAX_LEN_DIGITS: usize = 10;

/// A container in the middle of being parsed.
#[derive(Debug)]
enum Frame {
    List(Vec<Value>),
    Dict {
        entries: Vec<(String, Value)>,
        pending_key: Option<String>,
    },
}

/// Streaming bencode codec.
///
/// # Decoder
///
/// `decode` returns `Ok(Some(value))` once one complete top-level value has
/// been parsed, `Ok(None)` when the buffer holds only a prefix of the next
/// value, and `Err(Error::Bencode(…))` for malformed input: a non-digit
/// length prefix, a length above [`MAX_STRING_BYTES`], an empty or
/// overflowing integer, invalid UTF-8 inside a string, a non-string
/// dictionary key, a dangling dictionary key at container close, nesting
/// beyond [`MAX_DEPTH`], or a stray terminator.
///
/// # Encoder
///
/// Encoding is total over the [`Value`] model; dictionary entries are
/// written in stored order.
#[derive(Debug, Default)]
pub struct BencodeCodec {
    stack: Vec<Frame>,
}

impl BencodeCodec {
    /// Create a codec with empty parser state.
    #[must_use]
    pub fn new() -> Self {
        Self { stack: Vec::new() }
    }

    /// Attach a completed value to the innermost open container, or emit it
    /// when no container is open.
    fn complete(&mut self, value: Value) -> Result<Option<Value>> {
        match self.stack.last_mut() {
            None => Ok(Some(value)),
            Some(Frame::List(items)) => {
                items.push(value);
                Ok(None)
            }
            Some(Frame::Dict {
                entries,
                pending_key,
            }) => {
                match pending_key.take() {
                    Some(key) => entries.push((key, value)),
                    None => match value {
                        Value::Str(key) => *pending_key = Some(key),
                        other => {
                            return Err(Error::Bencode(format!(
                                "dictionary key must be a string, got {other:?}"
                            )))
                        }
                    },
                }
                Ok(None)
            }
        }
    }

    /// Close the innermost container on an `e` terminator.
    fn close_container(&mut self) -> Result<Option<Value>> {
        let Some(frame) = self.stack.pop() else {
            return Err(Error::Bencode("stray 'e' terminator".into()));
        };
        let value = match frame {
            Frame::List(items) => Value::List(items),
            Frame::Dict {
                entries,
                pending_key,
            } => {
                if let Some(key) = pending_key {
                    return Err(Error::Bencode(format!(
                        "dictionary key {key:?} has no value"
                    )));
                }
                Value::Dict(entries)
            }
        };
        self.complete(value)
    }

    /// Push a fresh container frame, enforcing the depth limit.
    fn open_container(&mut self, frame: Frame) -> Result<()> {
        if self.stack.len() >= MAX_DEPTH {
            return Err(Error::Bencode(format!(
                "container nesting exceeds {MAX_DEPTH} levels"
            )));
        }
        self.stack.push(frame);
        Ok(())
    }
}

impl Decoder for BencodeCodec {
    type Item = Value;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            let Some(&first) = src.first() else {
                return Ok(None);
            };

            let completed = match first {
                b'l' => {
                    self.open_container(Frame::List(Vec::new()))?;
                    src.advance(1);
                    None
                }
                b'd' => {
                    self.open_container(Frame::Dict {
                        entries: Vec::new(),
                        pending_key: None,
                    })?;
                    src.advance(1);
                    None
                }
                b'e' => {
                    src.advance(1);
                    self.close_container()?
                }
                b'i' => match take_integer(src)? {
                    None => return Ok(None),
                    Some(n) => self.complete(Value::Int(n))?,
                },
                b'0'..=b'9' => match take_string(src)? {
                    None => return Ok(None),
                    Some(s) => self.complete(Value::Str(s))?,
                },
                other => {
                    return Err(Error::Bencode(format!(
                        "unexpected byte 0x{other:02x} at value start"
                    )))
                }
            };

            if let Some(value) = completed {
                return Ok(Some(value));
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if let Some(value) = self.decode(src)? {
            return Ok(Some(value));
        }
        if !src.is_empty() || !self.stack.is_empty() {
            return Err(Error::Bencode(
                "stream ended inside an unterminated value".into(),
            ));
        }
        Ok(None)
    }
}

impl Encoder<Value> for BencodeCodec {
    type Error = Error;

    fn encode(&mut self, item: Value, dst: &mut BytesMut) -> Result<()> {
        write_value(&item, dst);
        Ok(())
    }
}

/// Encode a value into a freshly allocated byte vector.
#[must_use]
pub fn encode_to_vec(value: &Value) -> Vec<u8> {
    let mut buf = BytesMut::new();
    write_value(value, &mut buf);
    buf.to_vec()
}

// ── Private helpers ───────────────────────────────────────────────────────────

fn write_value(value: &Value, dst: &mut BytesMut) {
    match value {
        Value::Str(s) => {
            dst.extend_from_slice(s.len().to_string().as_bytes());
            dst.extend_from_slice(b":");
            dst.extend_from_slice(s.as_bytes());
        }
        Value::Int(n) => {
            dst.extend_from_slice(b"i");
            dst.extend_from_slice(n.to_string().as_bytes());
            dst.extend_from_slice(b"e");
        }
        Value::List(items) => {
            dst.extend_from_slice(b"l");
            for item in items {
                write_value(item, dst);
            }
            dst.extend_from_slice(b"e");
        }
        Value::Dict(entries) => {
            dst.extend_from_slice(b"d");
            for (key, val) in entries {
                dst.extend_from_slice(key.len().to_string().as_bytes());
                dst.extend_from_slice(b":");
                dst.extend_from_slice(key.as_bytes());
                write_value(val, dst);
            }
            dst.extend_from_slice(b"e");
        }
    }
}

/// Consume an `i<decimal>e` token from the buffer front.
///
/// Returns `Ok(None)` when the terminator has not arrived yet, erroring out
/// once the token body can no longer fit a valid `i64`.
fn take_integer(src: &mut BytesMut) -> Result<Option<i64>> {
    let Some(end) = src[1..].iter().position(|&b| b == b'e').map(|p| p + 1) else {
        if src.len() > 1 + MAX_INT_DIGITS {
            return Err(Error::Bencode("unterminated integer token".into()));
        }
        return Ok(None);
    };

    let body = &src[1..end];
    let text = std::str::from_utf8(body)
        .map_err(|_| Error::Bencode("non-ASCII bytes in integer token".into()))?;

    if text.is_empty() {
        return Err(Error::Bencode("empty integer token".into()));
    }
    let digits = text.strip_prefix('-').unwrap_or(text);
    if digits.is_empty() || digits.len() > 1 && digits.starts_with('0') || text == "-0" {
        return Err(Error::Bencode(format!("malformed integer {text:?}")));
    }

    let n: i64 = text
        .parse()
        .map_err(|_| Error::Bencode(format!("integer {text:?} out of range")))?;
    src.advance(end + 1);
    Ok(Some(n))
}

/// Consume a `<len>:<bytes>` token from the buffer front.
///
/// The length prefix is validated as soon as its `:` delimiter is visible;
/// the payload is only taken once fully buffered.
fn take_string(src: &mut BytesMut) -> Result<Option<String>> {
    let Some(colon) = src.iter().position(|&b| b == b':') else {
        if src.len() > MAX_LEN_DIGITS {
            return Err(Error::Bencode("unterminated string length prefix".into()));
        }
        return Ok(None);
    };

    let prefix = &src[..colon];
    if colon > MAX_LEN_DIGITS || !prefix.iter().all(u8::is_ascii_digit) {
        return Err(Error::Bencode(format!(
            "malformed string length prefix {:?}",
            String::from_utf8_lossy(prefix)
        )));
    }

    let len: usize = std::str::from_utf8(prefix)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Bencode("malformed string length prefix".into()))?;
    if len > MAX_STRING_BYTES {
        return Err(Error::Bencode(format!(
            "string length {len} exceeds {MAX_STRING_BYTES} bytes"
        )));
    }

    if src.len() < colon + 1 + len {
        return Ok(None);
    }

    src.advance(colon + 1);
    let bytes = src.split_to(len);
    let s = String::from_utf8(bytes.to_vec())
        .map_err(|_| Error::Bencode("string payload is not valid UTF-8".into()))?;
    Ok(Some(s))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
