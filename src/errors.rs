//! Error types shared across the client.

use std::fmt::{Display, Formatter};

/// Shared client result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Client error enumeration covering all domain failure modes.
///
/// Incomplete wire input is *not* represented here: the codec reports
/// "needs more bytes" through its `Ok(None)` decode result, and only
/// malformed input becomes [`Error::Bencode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Malformed bencode input: bad length prefix, invalid integer,
    /// unterminated container, or a non-string dictionary key.
    Bencode(String),
    /// Socket-level failure or the transport closed underneath a call.
    Io(String),
    /// The connect-time bootstrap sequence failed or timed out.
    Handshake(String),
    /// The server answered a request with an `unknown-op` status.
    UnknownOp(String),
    /// The capability set does not advertise the operation; nothing was sent.
    UnsupportedOp(String),
    /// Remote evaluation raised an exception; carries the exception text.
    Eval(String),
    /// The evaluation was interrupted before completing.
    Interrupted,
    /// Configuration parsing or validation failure.
    Config(String),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bencode(msg) => write!(f, "bencode: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Handshake(msg) => write!(f, "handshake: {msg}"),
            Self::UnknownOp(op) => write!(f, "unknown op: {op}"),
            Self::UnsupportedOp(op) => write!(f, "unsupported op: {op}"),
            Self::Eval(msg) => write!(f, "eval: {msg}"),
            Self::Interrupted => write!(f, "evaluation was interrupted"),
            Self::Config(msg) => write!(f, "config: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}
