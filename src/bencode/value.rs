//! Bencode value model.

/// A single bencode value.
///
/// Dictionaries preserve insertion order rather than sorting keys; the
/// encoder writes entries in stored order and the decoder keeps arrival
/// order, so a decoded value re-encodes to the bytes it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// UTF-8 byte string, length-prefixed on the wire.
    Str(String),
    /// Signed integer, `i<decimal>e` on the wire.
    Int(i64),
    /// Ordered, heterogeneous list, `l…e` on the wire.
    List(Vec<Value>),
    /// Key/value pairs with string keys, `d…e` on the wire.
    Dict(Vec<(String, Value)>),
}

impl Value {
    /// Borrow the string payload, if this is a string value.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Copy out the integer payload, if this is an integer value.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Borrow the element list, if this is a list value.
    #[must_use]
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    /// Borrow the entry list, if this is a dictionary value.
    #[must_use]
    pub fn as_dict(&self) -> Option<&[(String, Value)]> {
        match self {
            Self::Dict(entries) => Some(entries.as_slice()),
            _ => None,
        }
    }

    /// Look up the first entry with the given key in a dictionary value.
    ///
    /// Returns `None` for non-dictionary values and missing keys alike.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_dict()?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::List(items)
    }
}

impl From<Vec<(String, Value)>> for Value {
    fn from(entries: Vec<(String, Value)>) -> Self {
        Self::Dict(entries)
    }
}
