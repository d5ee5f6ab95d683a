//! Protocol message view and request builder.
//!
//! An nREPL message is a bencode dictionary. [`Message`] wraps a decoded
//! [`Value::Dict`] with typed accessors for the well-known fields, and doubles
//! as a builder for outbound requests. Every request carries a unique `id`;
//! every response echoes that `id`, and a single request may be answered by
//! several messages, the last of which carries a terminal status tag.

use crate::bencode::Value;
use crate::ops::Op;

/// Status tag marking the final response message for a correlation id.
pub const STATUS_DONE: &str = "done";

/// Status tag used by the debug middleware to hand control to the client;
/// also terminal for the originating request.
pub const STATUS_NEED_DEBUG_INPUT: &str = "need-debug-input";

/// Status tag requesting a line of stdin from the client.
pub const STATUS_NEED_INPUT: &str = "need-input";

/// Status tag reporting that the server does not implement the request's op.
pub const STATUS_UNKNOWN_OP: &str = "unknown-op";

/// One protocol message: an ordered mapping of string keys to values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    fields: Vec<(String, Value)>,
}

impl Message {
    /// Start building a request for `op` with the given correlation id.
    #[must_use]
    pub fn request(op: Op, id: &str) -> Self {
        Self {
            fields: vec![
                ("op".into(), Value::Str(op.as_str().into())),
                ("id".into(), Value::Str(id.into())),
            ],
        }
    }

    /// Append a field; builder-style.
    #[must_use]
    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.push((key.into(), value.into()));
        self
    }

    /// Append a field only when `value` is present; builder-style.
    #[must_use]
    pub fn opt_field(self, key: &str, value: Option<impl Into<Value>>) -> Self {
        match value {
            Some(v) => self.field(key, v),
            None => self,
        }
    }

    /// View a decoded value as a message. Non-dictionary values have no
    /// message interpretation and yield `None`.
    #[must_use]
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Dict(fields) => Some(Self { fields }),
            _ => None,
        }
    }

    /// Convert into the bencode value to put on the wire.
    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Dict(self.fields)
    }

    /// Look up a field by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Look up a string field by key.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// The correlation id, when present.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.get_str("id")
    }

    /// The owning session id, when present.
    #[must_use]
    pub fn session(&self) -> Option<&str> {
        self.get_str("session")
    }

    /// The session id returned by a `clone` response, when present.
    #[must_use]
    pub fn new_session(&self) -> Option<&str> {
        self.get_str("new-session")
    }

    /// The status tags carried by this message, empty when absent.
    #[must_use]
    pub fn status(&self) -> Vec<&str> {
        self.get("status")
            .and_then(Value::as_list)
            .map(|items| items.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    /// Whether the status set contains `tag`.
    #[must_use]
    pub fn has_status(&self, tag: &str) -> bool {
        self.status().contains(&tag)
    }

    /// Whether this message ends its correlation id's lifecycle.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.has_status(STATUS_DONE) || self.has_status(STATUS_NEED_DEBUG_INPUT)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
