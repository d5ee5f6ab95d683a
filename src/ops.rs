//! Protocol operation vocabulary and the server-advertised capability set.
//!
//! The op vocabulary is a closed set known at compile time; the server
//! advertises the subset it implements in its `describe` response, and every
//! outbound request is gated on membership before it is sent.

use std::collections::HashSet;
use std::fmt::{Display, Formatter};

use crate::message::Message;

/// A named operation the client can request of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// Evaluate a code form.
    Eval,
    /// Create a new session from an existing one.
    Clone,
    /// Report server capabilities and versions.
    Describe,
    /// Discard a session.
    Close,
    /// Interrupt an in-flight evaluation.
    Interrupt,
    /// Supply a line of standard input to a pending read.
    Stdin,
    /// Evaluate the full contents of a file.
    LoadFile,
    /// Complete a symbol prefix.
    Complete,
    /// Look up metadata for a symbol.
    Info,
    /// Report the effective classpath.
    Classpath,
    /// Run tests selected by a var query.
    TestVarQuery,
    /// Fetch the stacktrace of a failed test assertion.
    TestStacktrace,
    /// Re-run the tests that failed last time.
    Retest,
    /// Load all project namespaces.
    NsLoadAll,
    /// List loaded namespaces.
    NsList,
    /// Resolve the source path of a namespace.
    NsPath,
    /// Reload changed namespaces.
    Refresh,
    /// Reload all namespaces from scratch.
    RefreshAll,
    /// Format a code string.
    FormatCode,
    /// Arm the debug middleware for this session.
    InitDebugger,
    /// Answer a pending debug prompt.
    DebugInput,
    /// List defs currently instrumented for debugging.
    DebugInstrumentedDefs,
    /// List the server's live sessions.
    LsSessions,
    /// Subscribe this session to out-of-band output.
    OutSubscribe,
    /// Fetch the stacktrace of the last evaluation error.
    Stacktrace,
    /// Refresh the cached documentation corpus.
    ClojuredocsRefreshCache,
    /// Look up community documentation for a symbol.
    ClojuredocsLookup,
}

impl Op {
    /// The wire name of this operation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eval => "eval",
            Self::Clone => "clone",
            Self::Describe => "describe",
            Self::Close => "close",
            Self::Interrupt => "interrupt",
            Self::Stdin => "stdin",
            Self::LoadFile => "load-file",
            Self::Complete => "complete",
            Self::Info => "info",
            Self::Classpath => "classpath",
            Self::TestVarQuery => "test-var-query",
            Self::TestStacktrace => "test-stacktrace",
            Self::Retest => "retest",
            Self::NsLoadAll => "ns-load-all",
            Self::NsList => "ns-list",
            Self::NsPath => "ns-path",
            Self::Refresh => "refresh",
            Self::RefreshAll => "refresh-all",
            Self::FormatCode => "format-code",
            Self::InitDebugger => "init-debugger",
            Self::DebugInput => "debug-input",
            Self::DebugInstrumentedDefs => "debug-instrumented-defs",
            Self::LsSessions => "ls-sessions",
            Self::OutSubscribe => "out-subscribe",
            Self::Stacktrace => "stacktrace",
            Self::ClojuredocsRefreshCache => "clojuredocs-refresh-cache",
            Self::ClojuredocsLookup => "clojuredocs-lookup",
        }
    }

    /// Resolve a wire name back to a known op, `None` for names outside the
    /// vocabulary.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "eval" => Self::Eval,
            "clone" => Self::Clone,
            "describe" => Self::Describe,
            "close" => Self::Close,
            "interrupt" => Self::Interrupt,
            "stdin" => Self::Stdin,
            "load-file" => Self::LoadFile,
            "complete" => Self::Complete,
            "info" => Self::Info,
            "classpath" => Self::Classpath,
            "test-var-query" => Self::TestVarQuery,
            "test-stacktrace" => Self::TestStacktrace,
            "retest" => Self::Retest,
            "ns-load-all" => Self::NsLoadAll,
            "ns-list" => Self::NsList,
            "ns-path" => Self::NsPath,
            "refresh" => Self::Refresh,
            "refresh-all" => Self::RefreshAll,
            "format-code" => Self::FormatCode,
            "init-debugger" => Self::InitDebugger,
            "debug-input" => Self::DebugInput,
            "debug-instrumented-defs" => Self::DebugInstrumentedDefs,
            "ls-sessions" => Self::LsSessions,
            "out-subscribe" => Self::OutSubscribe,
            "stacktrace" => Self::Stacktrace,
            "clojuredocs-refresh-cache" => Self::ClojuredocsRefreshCache,
            "clojuredocs-lookup" => Self::ClojuredocsLookup,
            _ => return None,
        })
    }
}

impl Display for Op {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The set of operations the connected server advertises.
///
/// Captured once per connection from the bootstrap `describe` response.
/// Op names the client does not know are tolerated and ignored; known ops
/// absent from the set gate whether the client may send them.
#[derive(Debug, Clone, Default)]
pub struct CapabilitySet {
    ops: HashSet<Op>,
}

impl CapabilitySet {
    /// Build the set from a `describe` response's `ops` dictionary.
    #[must_use]
    pub fn from_describe(msg: &Message) -> Self {
        let ops = msg
            .get("ops")
            .and_then(crate::bencode::Value::as_dict)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|(name, _)| Op::from_name(name))
                    .collect()
            })
            .unwrap_or_default();
        Self { ops }
    }

    /// Whether the server advertises `op`.
    #[must_use]
    pub fn supports(&self, op: Op) -> bool {
        self.ops.contains(&op)
    }

    /// Number of advertised ops the client recognizes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether no recognized op was advertised.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
