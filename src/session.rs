//! Session: one logical conversation with the server.
//!
//! A session multiplexes many concurrent request/response (or
//! request/response-stream) exchanges over the single connection. Each
//! outbound request takes a fresh connection-wide correlation id and
//! registers a handler in the session's pending table; the reader task
//! routes every inbound message for this session here, where it is matched
//! back to its handler by id or falls through to the default handler.
//!
//! Every operation is capability-gated: an op the server did not advertise
//! is never written to the transport — the call records a diagnostic notice
//! and resolves empty instead (`interrupt` is the one exception and rejects
//! outright, since a caller asking to interrupt needs to know nothing
//! happened).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::bencode::Value;
use crate::collab::Hooks;
use crate::connection::{lock, ConnInner};
use crate::eval::{drive, EvalOptions, Evaluation};
use crate::message::{Message, STATUS_UNKNOWN_OP};
use crate::ops::Op;
use crate::{Error, Result};

/// REPL implementation dialect reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplFlavor {
    /// JVM Clojure.
    Clj,
    /// ClojureScript.
    Cljs,
}

impl ReplFlavor {
    /// Parse the wire spelling of a flavor tag.
    #[must_use]
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "clj" => Some(Self::Clj),
            "cljs" => Some(Self::Cljs),
            _ => None,
        }
    }
}

/// Accumulated outcome of a `refresh` / `refresh-all` exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshResult {
    /// Namespaces the server reported reloading, in order.
    pub reloaded: Vec<String>,
    /// Whether the server reported an `ok` status.
    pub succeeded: bool,
    /// Rendered error, when reloading failed.
    pub error: Option<String>,
    /// Namespace the failure occurred in, when reported.
    pub error_ns: Option<String>,
}

/// A registered response handler, removed once it signals completion.
pub(crate) enum PendingHandler {
    /// Resolved by the first message bearing the id.
    Once(oneshot::Sender<Message>),
    /// Fed every message for the id until a terminal status arrives.
    Stream(mpsc::UnboundedSender<Message>),
}

struct SessionInner {
    id: String,
    conn: Arc<ConnInner>,
    pending: Mutex<HashMap<String, PendingHandler>>,
    running: Mutex<HashSet<String>>,
    flavor: Mutex<Option<ReplFlavor>>,
    close_listeners: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    closed: AtomicBool,
}

/// Handle to one server session. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(conn: Arc<ConnInner>, id: &str) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id: id.to_owned(),
                conn,
                pending: Mutex::new(HashMap::new()),
                running: Mutex::new(HashSet::new()),
                flavor: Mutex::new(None),
                close_listeners: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// The server-assigned session id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Whether the connection's capability set advertises `op`.
    #[must_use]
    pub fn supports(&self, op: Op) -> bool {
        self.inner
            .conn
            .capabilities()
            .is_some_and(|caps| caps.supports(op))
    }

    /// The last REPL flavor learned from server messages, if any.
    #[must_use]
    pub fn repl_flavor(&self) -> Option<ReplFlavor> {
        *lock(&self.inner.flavor)
    }

    /// Register a listener fired exactly once when this session closes.
    ///
    /// Runs immediately when the session is already closed.
    pub fn on_close(&self, listener: impl FnOnce() + Send + 'static) {
        if self.inner.closed.load(Ordering::SeqCst) {
            listener();
            return;
        }
        lock(&self.inner.close_listeners).push(Box::new(listener));
    }

    // ── Message intake ────────────────────────────────────────────────────────

    /// Dispatch one inbound message by correlation id.
    ///
    /// Called from the connection's reader task only; handlers signalling
    /// completion are removed here, which is what makes a late terminal
    /// message for an interrupted id a no-op.
    pub(crate) fn on_message(&self, msg: Message) {
        let Some(id) = msg.id().map(str::to_owned) else {
            self.default_handle(&msg);
            return;
        };

        let handler = lock(&self.inner.pending).remove(&id);
        match handler {
            Some(PendingHandler::Once(tx)) => {
                lock(&self.inner.running).remove(&id);
                if tx.send(msg).is_err() {
                    debug!(id, "response handler dropped before delivery");
                }
            }
            Some(PendingHandler::Stream(tx)) => {
                let terminal = msg.is_terminal();
                let delivered = tx.send(msg).is_ok();
                if terminal {
                    lock(&self.inner.running).remove(&id);
                } else if delivered {
                    lock(&self.inner.pending).insert(id, PendingHandler::Stream(tx));
                }
            }
            None => self.default_handle(&msg),
        }
    }

    /// Handle a message no registered handler claimed: unsolicited output,
    /// status updates, or continuations of orphaned requests.
    fn default_handle(&self, msg: &Message) {
        if let Some(flavor) = msg.get_str("repl-type").and_then(ReplFlavor::from_wire) {
            *lock(&self.inner.flavor) = Some(flavor);
        }

        if let Some(id) = msg.id() {
            if msg.is_terminal() {
                lock(&self.inner.running).remove(id);
            } else {
                // Track orphaned in-flight ids so bulk interrupt can reach them.
                lock(&self.inner.running).insert(id.to_owned());
            }
        }

        // Output before the flavor is known is pre-handshake noise.
        if lock(&self.inner.flavor).is_some() {
            let output = &self.inner.conn.hooks().output;
            if let Some(out) = msg.get_str("out") {
                output.append(out);
            }
            if let Some(err) = msg.get_str("err") {
                output.append(err);
            }
        }
    }

    // ── Request plumbing ──────────────────────────────────────────────────────

    pub(crate) fn conn(&self) -> &Arc<ConnInner> {
        &self.inner.conn
    }

    pub(crate) fn hooks(&self) -> &Hooks {
        self.inner.conn.hooks()
    }

    pub(crate) fn insert_pending(&self, id: &str, handler: PendingHandler) {
        lock(&self.inner.pending).insert(id.to_owned(), handler);
    }

    pub(crate) fn remove_pending(&self, id: &str) {
        lock(&self.inner.pending).remove(id);
    }

    /// Gate an op on the capability set, recording a diagnostic when absent.
    fn gate(&self, op: Op) -> bool {
        if self.supports(op) {
            return true;
        }
        self.hooks()
            .diagnostics
            .note(&format!("op {op} not supported by this server"));
        false
    }

    /// Send `msg` and await its single response.
    ///
    /// A response carrying `unknown-op` still rejects even though the local
    /// gate passed: the capability set can go stale when server middleware
    /// is loaded or unloaded after `describe`.
    async fn roundtrip(&self, op: Op, id: &str, msg: Message) -> Result<Message> {
        let (tx, rx) = oneshot::channel();
        self.insert_pending(id, PendingHandler::Once(tx));
        if let Err(err) = self.inner.conn.send(msg.into_value()).await {
            self.remove_pending(id);
            return Err(err);
        }
        let resp = rx
            .await
            .map_err(|_| Error::Io(format!("connection closed awaiting response to id {id}")))?;
        if resp.has_status(STATUS_UNKNOWN_OP) {
            return Err(Error::UnknownOp(op.as_str().into()));
        }
        Ok(resp)
    }

    /// Capability-gated single-shot request: `Ok(None)` when the op is not
    /// advertised and nothing was sent.
    async fn gated<F>(&self, op: Op, build: F) -> Result<Option<Message>>
    where
        F: FnOnce(Message) -> Message + Send,
    {
        if !self.gate(op) {
            return Ok(None);
        }
        let id = self.inner.conn.next_id();
        let msg = build(Message::request(op, &id).field("session", self.id()));
        Ok(Some(self.roundtrip(op, &id, msg).await?))
    }

    // ── Protocol operations ───────────────────────────────────────────────────

    /// Ask the server to re-describe its capabilities.
    ///
    /// # Errors
    ///
    /// Rejects with `Error::UnknownOp` on a protocol-level refusal.
    pub async fn describe(&self, verbose: bool) -> Result<Option<Message>> {
        self.gated(Op::Describe, |m| {
            if verbose {
                m.field("verbose?", "true")
            } else {
                m
            }
        })
        .await
    }

    /// Subscribe this session to out-of-band output.
    pub async fn out_subscribe(&self) -> Result<Option<Message>> {
        self.gated(Op::OutSubscribe, |m| m).await
    }

    /// List the server's live sessions.
    pub async fn ls_sessions(&self) -> Result<Option<Message>> {
        self.gated(Op::LsSessions, |m| m).await
    }

    /// Fetch the stacktrace of the last evaluation error in this session.
    pub async fn stacktrace(&self) -> Result<Option<Message>> {
        self.gated(Op::Stacktrace, |m| m).await
    }

    /// Complete `prefix`, optionally scoped to `ns`, requesting arglist and
    /// doc metadata alongside the candidates.
    pub async fn complete(&self, ns: Option<&str>, prefix: &str) -> Result<Option<Message>> {
        self.gated(Op::Complete, |m| {
            m.opt_field("ns", ns)
                .field("symbol", prefix)
                .field(
                    "extra-metadata",
                    vec![Value::from("arglists"), Value::from("doc")],
                )
        })
        .await
    }

    /// Look up metadata for `symbol`, optionally scoped to `ns`.
    pub async fn info(&self, ns: Option<&str>, symbol: &str) -> Result<Option<Message>> {
        self.gated(Op::Info, |m| m.opt_field("ns", ns).field("symbol", symbol))
            .await
    }

    /// Report the effective classpath.
    pub async fn classpath(&self) -> Result<Option<Message>> {
        self.gated(Op::Classpath, |m| m).await
    }

    /// Run the tests selected by a raw var query.
    pub async fn test_var_query(&self, query: Value) -> Result<Option<Message>> {
        self.gated(Op::TestVarQuery, |m| m.field("var-query", query))
            .await
    }

    /// Run specific test vars in `ns`.
    pub async fn test(&self, ns: &str, vars: &[&str]) -> Result<Option<Message>> {
        let exactly: Vec<Value> = vars
            .iter()
            .map(|var| Value::from(format!("{ns}/{var}")))
            .collect();
        let query = Value::Dict(vec![
            (
                "ns-query".into(),
                Value::Dict(vec![("exactly".into(), Value::List(vec![ns.into()]))]),
            ),
            ("exactly".into(), Value::List(exactly)),
        ]);
        self.test_var_query(query).await
    }

    /// Run every test in `ns`.
    pub async fn test_ns(&self, ns: &str) -> Result<Option<Message>> {
        let query = Value::Dict(vec![(
            "ns-query".into(),
            Value::Dict(vec![("exactly".into(), Value::List(vec![ns.into()]))]),
        )]);
        self.test_var_query(query).await
    }

    /// Run every test in the project.
    pub async fn test_all(&self) -> Result<Option<Message>> {
        let query = Value::Dict(vec![(
            "ns-query".into(),
            Value::Dict(vec![
                ("project?".into(), Value::from("true")),
                ("load-project-ns?".into(), Value::from("true")),
            ]),
        )]);
        self.test_var_query(query).await
    }

    /// Fetch the stacktrace of a failed test assertion.
    pub async fn test_stacktrace(
        &self,
        ns: &str,
        var: &str,
        index: i64,
    ) -> Result<Option<Message>> {
        self.gated(Op::TestStacktrace, |m| {
            m.field("ns", ns).field("var", var).field("index", index)
        })
        .await
    }

    /// Re-run the tests that failed last time.
    pub async fn retest(&self) -> Result<Option<Message>> {
        self.gated(Op::Retest, |m| m).await
    }

    /// Load all project namespaces.
    pub async fn ns_load_all(&self) -> Result<Option<Message>> {
        self.gated(Op::NsLoadAll, |m| m).await
    }

    /// List loaded namespaces.
    pub async fn ns_list(&self) -> Result<Option<Message>> {
        self.gated(Op::NsList, |m| m).await
    }

    /// Resolve the source path of `ns`.
    pub async fn ns_path(&self, ns: &str) -> Result<Option<Message>> {
        self.gated(Op::NsPath, |m| m.field("ns", ns)).await
    }

    /// Reload changed namespaces, accumulating the streamed report.
    pub async fn refresh(&self) -> Result<Option<RefreshResult>> {
        self.run_refresh(Op::Refresh).await
    }

    /// Reload all namespaces from scratch, accumulating the streamed report.
    pub async fn refresh_all(&self) -> Result<Option<RefreshResult>> {
        self.run_refresh(Op::RefreshAll).await
    }

    async fn run_refresh(&self, op: Op) -> Result<Option<RefreshResult>> {
        if !self.gate(op) {
            return Ok(None);
        }
        let id = self.inner.conn.next_id();
        let msg = Message::request(op, &id).field("session", self.id());

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.insert_pending(&id, PendingHandler::Stream(tx));
        if let Err(err) = self.inner.conn.send(msg.into_value()).await {
            self.remove_pending(&id);
            return Err(err);
        }

        let mut result = RefreshResult::default();
        let mut completed = false;
        while let Some(msg) = rx.recv().await {
            if msg.has_status(STATUS_UNKNOWN_OP) {
                return Err(Error::UnknownOp(op.as_str().into()));
            }
            if let Some(list) = msg.get("reloading").and_then(Value::as_list) {
                result
                    .reloaded
                    .extend(list.iter().filter_map(Value::as_str).map(str::to_owned));
            }
            if msg.has_status("ok") {
                result.succeeded = true;
            }
            if msg.has_status("error") {
                result.succeeded = false;
            }
            if let Some(error) = msg.get_str("error") {
                result.error = Some(error.to_owned());
            }
            if let Some(error_ns) = msg.get_str("error-ns") {
                result.error_ns = Some(error_ns.to_owned());
            }
            if msg.is_terminal() {
                completed = true;
                break;
            }
        }

        if completed {
            Ok(Some(result))
        } else {
            Err(Error::Io(format!(
                "connection closed during {op} before completion"
            )))
        }
    }

    /// Format a code string with the server-side formatter.
    pub async fn format_code(&self, code: &str) -> Result<Option<Message>> {
        self.gated(Op::FormatCode, |m| m.field("code", code)).await
    }

    /// Arm the debug middleware for this session.
    ///
    /// Fire-and-forget: the response arrives when the first breakpoint is
    /// hit, possibly much later, keyed by the same id; it is forwarded to
    /// the debug bridge without blocking the caller.
    pub async fn init_debugger(&self) -> Result<()> {
        if !self.gate(Op::InitDebugger) {
            return Ok(());
        }
        let id = self.inner.conn.next_id();
        let msg = Message::request(Op::InitDebugger, &id).field("session", self.id());

        let (tx, rx) = oneshot::channel();
        self.insert_pending(&id, PendingHandler::Once(tx));
        if let Err(err) = self.inner.conn.send(msg.into_value()).await {
            self.remove_pending(&id);
            return Err(err);
        }

        let bridge = self.hooks().debug.clone();
        tokio::spawn(async move {
            if let Ok(msg) = rx.await {
                match bridge {
                    Some(bridge) => bridge.on_debug_event(&msg),
                    None => debug!("debugger response dropped: no debug bridge configured"),
                }
            }
        });
        Ok(())
    }

    /// Answer a pending debug prompt directly.
    ///
    /// `debug_id` is the pending debug-response correlation id handed out by
    /// the debug middleware, not a fresh id.
    pub async fn debug_input(
        &self,
        input: &str,
        debug_id: &str,
        key: &str,
    ) -> Result<Option<Message>> {
        if !self.gate(Op::DebugInput) {
            return Ok(None);
        }
        let msg = Message::request(Op::DebugInput, debug_id)
            .field("session", self.id())
            .field("input", input)
            .field("key", key);
        Ok(Some(self.roundtrip(Op::DebugInput, debug_id, msg).await?))
    }

    /// List defs currently instrumented for debugging.
    pub async fn debug_instrumented_defs(&self) -> Result<Option<Message>> {
        self.gated(Op::DebugInstrumentedDefs, |m| m).await
    }

    /// Refresh the server's cached documentation corpus.
    pub async fn clojuredocs_refresh_cache(&self) -> Result<Option<Message>> {
        self.gated(Op::ClojuredocsRefreshCache, |m| m).await
    }

    /// Look up community documentation for `symbol` in `ns`.
    pub async fn clojuredocs_lookup(&self, ns: &str, symbol: &str) -> Result<Option<Message>> {
        self.gated(Op::ClojuredocsLookup, |m| m.field("ns", ns).field("sym", symbol))
            .await
    }

    /// Supply one line of standard input to a pending read.
    ///
    /// Fire-and-forget: the acknowledgement is terminal and is absorbed by
    /// the default handler.
    pub async fn send_stdin(&self, text: &str) -> Result<()> {
        if !self.gate(Op::Stdin) {
            return Ok(());
        }
        let id = self.inner.conn.next_id();
        let msg = Message::request(Op::Stdin, &id)
            .field("session", self.id())
            .field("stdin", text);
        self.inner.conn.send(msg.into_value()).await
    }

    /// Interrupt the in-flight request identified by `target_id`.
    ///
    /// # Errors
    ///
    /// Unlike the other gated operations, an unsupported `interrupt` rejects
    /// with `Error::UnsupportedOp` — silently resolving would leave the
    /// caller believing the evaluation was stopped.
    pub async fn interrupt(&self, target_id: &str) -> Result<Message> {
        if !self.supports(Op::Interrupt) {
            self.hooks()
                .diagnostics
                .note("op interrupt not supported by this server");
            return Err(Error::UnsupportedOp("interrupt".into()));
        }
        let id = self.inner.conn.next_id();
        let msg = Message::request(Op::Interrupt, &id)
            .field("session", self.id())
            .field("interrupt-id", target_id);
        self.roundtrip(Op::Interrupt, &id, msg).await
    }

    /// Interrupt every orphaned in-flight id tracked by the default handler.
    ///
    /// Snapshots and clears the running set, then issues one `interrupt`
    /// per id; per-id failures are logged and do not stop the sweep.
    /// Returns the number of interrupts attempted.
    pub async fn interrupt_running(&self) -> usize {
        let ids: Vec<String> = {
            let mut running = lock(&self.inner.running);
            running.drain().collect()
        };
        let count = ids.len();
        for id in ids {
            if let Err(err) = self.interrupt(&id).await {
                warn!(id, %err, "interrupt of running id failed");
            }
        }
        count
    }

    // ── Evaluation ────────────────────────────────────────────────────────────

    /// Submit `code` for evaluation.
    ///
    /// When the debug bridge holds a pending debug prompt, the code is
    /// redirected into that debug interaction (`debug-input` keyed by the
    /// pending id) instead of a plain `eval`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` when the request cannot be written. An op absent
    /// from the capability set does not error: the returned evaluation is
    /// already resolved with an empty value and nothing is sent.
    pub async fn eval(&self, code: &str, options: EvalOptions) -> Result<Evaluation> {
        let redirect = self
            .hooks()
            .debug
            .as_ref()
            .and_then(|bridge| bridge.take_pending());

        let (op, id, msg) = if let Some((debug_id, key)) = redirect {
            let msg = Message::request(Op::DebugInput, &debug_id)
                .field("session", self.id())
                .field("input", code)
                .field("key", key);
            (Op::DebugInput, debug_id, msg)
        } else {
            let id = self.inner.conn.next_id();
            let msg = Message::request(Op::Eval, &id)
                .field("session", self.id())
                .field("code", code)
                .opt_field("ns", options.ns.as_deref())
                .opt_field("line", options.line)
                .opt_field("column", options.column)
                .opt_field("file", options.file.as_deref());
            (Op::Eval, id, msg)
        };

        self.start_evaluation(op, id, msg, options).await
    }

    /// Evaluate the full contents of a file.
    pub async fn load_file(&self, contents: &str, options: EvalOptions) -> Result<Evaluation> {
        let id = self.inner.conn.next_id();
        let file_name = options
            .file
            .as_deref()
            .and_then(|path| path.rsplit(['/', '\\']).next().map(str::to_owned));
        let msg = Message::request(Op::LoadFile, &id)
            .field("session", self.id())
            .field("file", contents)
            .opt_field("file-name", file_name)
            .opt_field("file-path", options.file.as_deref());
        self.start_evaluation(Op::LoadFile, id, msg, options).await
    }

    async fn start_evaluation(
        &self,
        op: Op,
        id: String,
        msg: Message,
        options: EvalOptions,
    ) -> Result<Evaluation> {
        let evaluation = Evaluation::new(self.clone(), id.clone(), options);
        if !self.gate(op) {
            evaluation.settle_empty();
            return Ok(evaluation);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.insert_pending(&id, PendingHandler::Stream(tx));
        tokio::spawn(drive(evaluation.clone(), rx));

        if let Err(err) = self.inner.conn.send(msg.into_value()).await {
            self.remove_pending(&id);
            return Err(err);
        }
        Ok(evaluation)
    }

    /// Evaluate an in-namespace-switch form and await its value.
    ///
    /// A convenience over `eval`; there is no separate protocol operation.
    ///
    /// # Errors
    ///
    /// Propagates evaluation failure or interruption.
    pub async fn switch_ns(&self, ns: &str) -> Result<String> {
        let evaluation = self.eval(&format!("(in-ns '{ns})"), EvalOptions::default()).await?;
        evaluation.wait().await
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Clone a new isolated session from this one.
    ///
    /// # Errors
    ///
    /// `clone` is a core protocol op, so a server not advertising it
    /// rejects with `Error::UnsupportedOp` rather than resolving empty; a
    /// clone response without a `new-session` field rejects with
    /// `Error::Handshake`.
    pub async fn clone_session(&self) -> Result<Self> {
        match self.gated(Op::Clone, |m| m).await? {
            None => Err(Error::UnsupportedOp("clone".into())),
            Some(resp) => {
                let session_id = resp.new_session().ok_or_else(|| {
                    Error::Handshake("clone response missing new-session field".into())
                })?;
                let session = Self::new(Arc::clone(&self.inner.conn), session_id);
                self.inner.conn.register_session(session.clone());
                Ok(session)
            }
        }
    }

    /// Close this session.
    ///
    /// Sends a best-effort `close` op when supported (send failures are
    /// swallowed), then unconditionally clears the running set, drops every
    /// pending handler, removes the session from the connection registry,
    /// and fires close listeners. Safe to call at most once; later inbound
    /// messages for this session are dropped by the reader.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.supports(Op::Close) {
            let id = self.inner.conn.next_id();
            let msg = Message::request(Op::Close, &id).field("session", self.id());
            if let Err(err) = self.inner.conn.send(msg.into_value()).await {
                debug!(%err, "close op send failed, continuing teardown");
            }
        } else {
            self.hooks()
                .diagnostics
                .note("op close not supported by this server");
        }
        self.inner.conn.remove_session(self.id());
        self.teardown();
    }

    /// Connection-level close notification: tear down without sending a
    /// per-session close handshake.
    pub(crate) fn notify_connection_closed(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.teardown();
    }

    fn teardown(&self) {
        lock(&self.inner.running).clear();
        lock(&self.inner.pending).clear();
        let listeners: Vec<Box<dyn FnOnce() + Send>> =
            lock(&self.inner.close_listeners).drain(..).collect();
        for listener in listeners {
            listener();
        }
    }
}
