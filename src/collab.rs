//! External collaborator traits.
//!
//! The client core renders nothing and prompts for nothing itself; output,
//! pretty-printing, interactive input, diagnostics, and debug-session
//! adapters are consumed through these narrow traits. A [`Hooks`] bundle
//! carries one of each (with tracing-backed defaults for output and
//! diagnostics) and is handed to the connection at creation time.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::message::Message;
use crate::Error;

/// Boxed future used by async collaborator traits, so implementors stay
/// object-safe without an async-trait macro.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Destination for streamed evaluation output.
pub trait OutputSink: Send + Sync {
    /// Append text without a trailing newline.
    fn append(&self, text: &str);
    /// Append one full line.
    fn append_line(&self, text: &str);
    /// Re-render the input prompt after out-of-band output.
    fn append_prompt(&self);
}

/// Renders an evaluation result for display.
pub trait PrettyPrinter: Send + Sync {
    /// Render `value`; an `Err` carries the printer's own failure text and
    /// leaves the raw value in force.
    fn render(&self, value: &str) -> std::result::Result<String, String>;
}

/// Interactive prompt used when an evaluation requests stdin and no
/// programmatic provider was supplied.
pub trait InputPrompt: Send + Sync {
    /// Ask the user for a line. `Ok(None)` means the prompt was dismissed
    /// without input.
    fn prompt(&self) -> BoxFuture<'_, std::result::Result<Option<String>, String>>;
}

/// Programmatic stdin source attached to a single evaluation.
pub trait StdinProvider: Send + Sync {
    /// Produce the next line of input for a pending read.
    fn provide(&self) -> BoxFuture<'_, std::result::Result<String, String>>;
}

/// Sink for diagnostic notices such as unsupported-operation reports.
pub trait DiagnosticSink: Send + Sync {
    /// Record one diagnostic line.
    fn note(&self, text: &str);
}

/// Adapter to an active debug session.
///
/// While a debug prompt is pending, plain evaluations are redirected into
/// the debug interaction: the bridge hands out the pending response id/key
/// pair, and responses to `init-debugger` are forwarded back through it.
pub trait DebugBridge: Send + Sync {
    /// Take the pending debug-response correlation id and key, if a debug
    /// prompt is currently awaiting an answer.
    fn take_pending(&self) -> Option<(String, String)>;
    /// Deliver an asynchronous debug-middleware response.
    fn on_debug_event(&self, msg: &Message);
}

/// Callback observing terminal transport failures.
pub type ErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;

/// Per-evaluation output callback.
pub type OutputCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Collaborator bundle handed to [`Connection::connect`].
///
/// [`Connection::connect`]: crate::connection::Connection::connect
#[derive(Clone)]
pub struct Hooks {
    /// Output rendering sink for streamed `out`/`err` payloads.
    pub output: Arc<dyn OutputSink>,
    /// Optional client-side result re-renderer.
    pub printer: Option<Arc<dyn PrettyPrinter>>,
    /// Optional interactive stdin prompt.
    pub prompt: Option<Arc<dyn InputPrompt>>,
    /// Diagnostic sink for unsupported-op notices.
    pub diagnostics: Arc<dyn DiagnosticSink>,
    /// Optional debug-session adapter.
    pub debug: Option<Arc<dyn DebugBridge>>,
    /// Optional observer for terminal transport failures.
    pub on_error: Option<ErrorCallback>,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            output: Arc::new(LogOutput),
            printer: None,
            prompt: None,
            diagnostics: Arc::new(LogDiagnostics),
            debug: None,
            on_error: None,
        }
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("printer", &self.printer.is_some())
            .field("prompt", &self.prompt.is_some())
            .field("debug", &self.debug.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish_non_exhaustive()
    }
}

// ── Default implementations ───────────────────────────────────────────────────

/// Output sink that forwards everything to the `tracing` log stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogOutput;

impl OutputSink for LogOutput {
    fn append(&self, text: &str) {
        info!(target: "repl_intercom::output", "{text}");
    }

    fn append_line(&self, text: &str) {
        info!(target: "repl_intercom::output", "{text}");
    }

    fn append_prompt(&self) {
        debug!(target: "repl_intercom::output", "prompt");
    }
}

/// Diagnostic sink that logs notices at `WARN`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogDiagnostics;

impl DiagnosticSink for LogDiagnostics {
    fn note(&self, text: &str) {
        warn!(target: "repl_intercom::diagnostics", "{text}");
    }
}
