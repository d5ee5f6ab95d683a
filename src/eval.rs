//! Evaluation: the stateful accumulator for one eval or load-file request.
//!
//! One request of the eval class is answered by a stream of messages —
//! fragments of stdout/stderr, namespace changes, debug-middleware errors,
//! finally a value or exception under a terminal status. An [`Evaluation`]
//! collects that stream into one outcome and resolves exactly once.
//!
//! Each evaluation is driven by its own task consuming the session's
//! streaming handler channel, so a stdin suspension (`need-input`) parks
//! only that task; the transport keeps delivering messages for every other
//! correlation id.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::bencode::Value;
use crate::collab::{OutputCallback, StdinProvider};
use crate::connection::lock;
use crate::message::{Message, STATUS_NEED_INPUT};
use crate::ops::Op;
use crate::session::Session;
use crate::{Error, Result};

/// Exception text installed by a local interrupt.
const INTERRUPT_EXCEPTION: &str = "evaluation was interrupted";

/// Sentinel value reported when a debug session is quit; error text arriving
/// alongside it is noise and is suppressed.
const DEBUG_SESSION_ENDED: &str = "debug-session-terminated";

/// Per-evaluation options and callbacks.
#[derive(Clone, Default)]
pub struct EvalOptions {
    /// Namespace to evaluate in.
    pub ns: Option<String>,
    /// Source line of the form, for error positions.
    pub line: Option<i64>,
    /// Source column of the form.
    pub column: Option<i64>,
    /// Source file path, also used to name load-file payloads.
    pub file: Option<String>,
    /// Callback receiving streamed stdout fragments.
    pub stdout: Option<OutputCallback>,
    /// Callback receiving streamed stderr fragments.
    pub stderr: Option<OutputCallback>,
    /// Programmatic stdin source consulted on `need-input`.
    pub stdin: Option<Arc<dyn StdinProvider>>,
}

impl std::fmt::Debug for EvalOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvalOptions")
            .field("ns", &self.ns)
            .field("line", &self.line)
            .field("column", &self.column)
            .field("file", &self.file)
            .field("stdin", &self.stdin.is_some())
            .finish_non_exhaustive()
    }
}

/// Terminal outcome of an evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Value(String),
    Exception(String),
    Interrupted,
    Aborted(String),
}

#[derive(Default)]
struct EvalState {
    output: String,
    error_output: String,
    value: Option<String>,
    pprint: Option<String>,
    exception: Option<String>,
    stacktrace: Option<Value>,
    ns: Option<String>,
}

struct EvalShared {
    id: String,
    session: Session,
    stdout: Option<OutputCallback>,
    stderr: Option<OutputCallback>,
    stdin: Option<Arc<dyn StdinProvider>>,
    state: Mutex<EvalState>,
    started: AtomicBool,
    finished: AtomicBool,
    interrupted: AtomicBool,
    outcome: watch::Sender<Option<Outcome>>,
}

impl EvalShared {
    /// Resolve or reject exactly once; later calls are no-ops.
    fn settle(&self, outcome: Outcome) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        self.outcome.send_replace(Some(outcome));
    }

    fn forward_out(&self, text: &str) {
        match &self.stdout {
            Some(cb) => cb(text),
            None => self.session.hooks().output.append(text),
        }
    }

    fn forward_err(&self, text: &str) {
        match &self.stderr {
            Some(cb) => cb(text),
            None => self.session.hooks().output.append(text),
        }
    }
}

/// Handle to one in-flight (or settled) evaluation. Cheap to clone.
#[derive(Clone)]
pub struct Evaluation {
    shared: Arc<EvalShared>,
}

impl std::fmt::Debug for Evaluation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evaluation")
            .field("id", &self.shared.id)
            .field("finished", &self.is_finished())
            .field("interrupted", &self.is_interrupted())
            .finish_non_exhaustive()
    }
}

impl Evaluation {
    pub(crate) fn new(session: Session, id: String, options: EvalOptions) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            shared: Arc::new(EvalShared {
                id,
                session,
                stdout: options.stdout,
                stderr: options.stderr,
                stdin: options.stdin,
                state: Mutex::new(EvalState::default()),
                started: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                interrupted: AtomicBool::new(false),
                outcome,
            }),
        }
    }

    /// Resolve immediately with an empty value; used when the op was gated
    /// out and nothing was sent.
    pub(crate) fn settle_empty(&self) {
        self.shared.settle(Outcome::Value(String::new()));
    }

    /// The correlation id shared with the originating request.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Whether the first response message has arrived and no terminal state
    /// has been reached yet.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.started.load(Ordering::SeqCst) && !self.is_finished()
    }

    /// Whether the evaluation has resolved or rejected.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::SeqCst)
    }

    /// Whether the evaluation was interrupted locally.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.shared.interrupted.load(Ordering::SeqCst)
    }

    /// Accumulated stdout so far.
    #[must_use]
    pub fn output(&self) -> String {
        lock(&self.shared.state).output.clone()
    }

    /// Accumulated stderr so far.
    #[must_use]
    pub fn error_output(&self) -> String {
        lock(&self.shared.state).error_output.clone()
    }

    /// The raw result value, once one has arrived.
    #[must_use]
    pub fn value(&self) -> Option<String> {
        lock(&self.shared.state).value.clone()
    }

    /// The exception text, once one has been detected.
    #[must_use]
    pub fn exception(&self) -> Option<String> {
        lock(&self.shared.state).exception.clone()
    }

    /// The stored stacktrace, when one was fetched or streamed.
    #[must_use]
    pub fn stacktrace(&self) -> Option<Value> {
        lock(&self.shared.state).stacktrace.clone()
    }

    /// The namespace last reported by the server for this evaluation.
    #[must_use]
    pub fn ns(&self) -> Option<String> {
        lock(&self.shared.state).ns.clone()
    }

    /// Await the terminal outcome. Any number of waiters may call this.
    ///
    /// # Errors
    ///
    /// - `Error::Eval` — the evaluation raised an exception (the message is
    ///   empty on the debug-error path, whose trace was already streamed).
    /// - `Error::Interrupted` — the evaluation was interrupted.
    /// - `Error::Io` — the connection went away before a terminal message.
    pub async fn wait(&self) -> Result<String> {
        let mut rx = self.shared.outcome.subscribe();
        loop {
            let current = rx.borrow().clone();
            if let Some(outcome) = current {
                return match outcome {
                    Outcome::Value(v) => Ok(v),
                    Outcome::Exception(msg) => Err(Error::Eval(msg)),
                    Outcome::Interrupted => Err(Error::Interrupted),
                    Outcome::Aborted(msg) => Err(Error::Io(msg)),
                };
            }
            if rx.changed().await.is_err() {
                return Err(Error::Io("evaluation abandoned".into()));
            }
        }
    }

    /// Interrupt this evaluation.
    ///
    /// Only effective while running and not already interrupted; otherwise a
    /// no-op. Local state is authoritative: the evaluation rejects
    /// immediately and its pending handler is removed so a late terminal
    /// message cannot re-trigger resolution, independent of whether the
    /// server honors the advisory `interrupt` request.
    ///
    /// # Errors
    ///
    /// Propagates failure of the server-side `interrupt` request, including
    /// `Error::UnsupportedOp` when the capability set lacks it. Local state
    /// has already transitioned by then.
    pub async fn interrupt(&self) -> Result<()> {
        let shared = &self.shared;
        if !shared.started.load(Ordering::SeqCst) || shared.finished.load(Ordering::SeqCst) {
            return Ok(());
        }
        if shared.interrupted.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        shared.session.conn().remove_eval(&shared.id);
        {
            let mut st = lock(&shared.state);
            st.exception = Some(INTERRUPT_EXCEPTION.to_owned());
            st.stacktrace = Some(Value::Str(String::new()));
        }
        // Late responses for this id must find no handler.
        shared.session.remove_pending(&shared.id);
        shared.settle(Outcome::Interrupted);

        shared.session.interrupt(&shared.id).await?;
        Ok(())
    }

    // ── Message handling ──────────────────────────────────────────────────────

    /// Fold one server message into the accumulated state.
    ///
    /// Returns `true` when the message was terminal.
    pub(crate) async fn handle(&self, msg: &Message) -> bool {
        let shared = &self.shared;
        if !shared.started.swap(true, Ordering::SeqCst) {
            shared.session.conn().register_eval(self.clone());
        }
        let interrupted = shared.interrupted.load(Ordering::SeqCst);

        // Mutate accumulated state under the lock; run callbacks after.
        let mut forward_out: Option<String> = None;
        let mut forward_err: Vec<String> = Vec::new();
        {
            let mut st = lock(&shared.state);

            if let Some(out) = msg.get_str("out") {
                st.output.push_str(out);
                if !interrupted {
                    forward_out = Some(out.to_owned());
                }
            }

            if let Some(err) = msg.get_str("err") {
                // Error chatter after quitting a debug session is noise.
                if st.value.as_deref() != Some(DEBUG_SESSION_ENDED) {
                    st.error_output.push_str(err);
                    if !interrupted {
                        forward_err.push(err.to_owned());
                    }
                }
            }

            if let Some(ns) = msg.get_str("ns") {
                st.ns = Some(ns.to_owned());
            }

            if let Some(ex) = msg.get_str("ex") {
                st.exception = Some(ex.to_owned());
            }

            if msg.has_status("eval-error") {
                if let Some(first) = msg
                    .get("causes")
                    .and_then(Value::as_list)
                    .and_then(<[Value]>::first)
                {
                    let class = first.get("class").and_then(Value::as_str).unwrap_or("");
                    let text = first.get("message").and_then(Value::as_str).unwrap_or("");
                    let formatted = format!("{class}: {text}\n");
                    if let Some(trace) = first.get("stacktrace") {
                        st.stacktrace = Some(trace.clone());
                    }
                    st.error_output.push_str(&formatted);
                    if !interrupted {
                        forward_err.push(formatted);
                    }
                }
            }

            // A debug-value wins over a plain value in the same message.
            if let Some(value) = msg.get_str("debug-value") {
                st.value = Some(value.to_owned());
            } else if let Some(value) = msg.get_str("value") {
                st.value = Some(value.to_owned());
            }

            if let Some(pprint) = msg.get_str("pprint-out") {
                st.pprint = Some(pprint.to_owned());
            }
        }

        if let Some(text) = forward_out {
            shared.forward_out(&text);
        }
        for text in forward_err {
            shared.forward_err(&text);
        }

        if msg.has_status(STATUS_NEED_INPUT) {
            self.handle_need_input().await;
        }

        if msg.is_terminal() {
            self.finish().await;
            return true;
        }
        false
    }

    /// Satisfy a `need-input` suspension.
    async fn handle_need_input(&self) {
        let shared = &self.shared;

        if let Some(provider) = shared.stdin.clone() {
            match provider.provide().await {
                Ok(text) => {
                    let line = format!("{}\n", text.trim());
                    if let Err(err) = shared.session.send_stdin(&line).await {
                        warn!(id = %shared.id, %err, "failed to send provided stdin");
                    }
                }
                Err(cause) => {
                    shared.forward_err(&format!("stdin provider failed: {cause}\n"));
                    if let Err(err) = shared.session.send_stdin("\n").await {
                        warn!(id = %shared.id, %err, "failed to send blank stdin line");
                    }
                }
            }
            return;
        }

        let prompt = shared.session.hooks().prompt.clone();
        match prompt {
            Some(prompt) => match prompt.prompt().await {
                Ok(Some(line)) => {
                    let line = format!("{}\n", line.trim());
                    if let Err(err) = shared.session.send_stdin(&line).await {
                        warn!(id = %shared.id, %err, "failed to send prompted stdin");
                    }
                }
                Ok(None) => {
                    shared.forward_out("no input supplied, interrupting evaluation\n");
                    if let Err(err) = self.interrupt().await {
                        warn!(id = %shared.id, %err, "self-interrupt after empty prompt failed");
                    }
                }
                Err(cause) => {
                    warn!(id = %shared.id, cause, "stdin prompt failed, sending blank line");
                    if let Err(err) = shared.session.send_stdin("\n").await {
                        warn!(id = %shared.id, %err, "failed to send blank stdin line");
                    }
                }
            },
            None => {
                shared
                    .session
                    .hooks()
                    .diagnostics
                    .note("evaluation requested stdin but no prompt is configured");
                if let Err(err) = shared.session.send_stdin("\n").await {
                    warn!(id = %shared.id, %err, "failed to send blank stdin line");
                }
            }
        }
    }

    /// Resolve the terminal state.
    async fn finish(&self) {
        let shared = &self.shared;
        shared.session.conn().remove_eval(&shared.id);

        let (exception, pprint, value, has_trace) = {
            let st = lock(&shared.state);
            (
                st.exception.clone(),
                st.pprint.clone(),
                st.value.clone(),
                st.stacktrace.is_some(),
            )
        };
        let debug_quit = value.as_deref() == Some(DEBUG_SESSION_ENDED);

        if let Some(exception) = exception.clone() {
            if !debug_quit {
                if shared.session.supports(Op::Stacktrace) {
                    // Best-effort enrichment: the rejection proceeds with the
                    // already-known exception text either way.
                    match shared.session.stacktrace().await {
                        Ok(Some(resp)) => {
                            lock(&shared.state).stacktrace = Some(resp.into_value());
                        }
                        Ok(None) => {}
                        Err(err) => {
                            debug!(id = %shared.id, %err, "stacktrace fetch failed");
                        }
                    }
                }
                shared.settle(Outcome::Exception(exception));
                return;
            }
        }

        if let Some(pprint) = pprint {
            shared.settle(Outcome::Value(pprint));
            return;
        }

        if has_trace && exception.is_none() {
            // Debug-error path: the trace was already streamed through err.
            shared.settle(Outcome::Exception(String::new()));
            return;
        }

        let raw = value.unwrap_or_default();
        let rendered = match shared.session.hooks().printer.as_ref() {
            Some(printer) => match printer.render(&raw) {
                Ok(rendered) => rendered,
                Err(cause) => {
                    shared.forward_err(&format!("pretty-printing failed: {cause}\n"));
                    raw
                }
            },
            None => raw,
        };
        shared.settle(Outcome::Value(rendered));
    }
}

/// Per-evaluation driver task: consumes the streaming handler channel until
/// a terminal message or the channel closes underneath it.
pub(crate) async fn drive(eval: Evaluation, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(msg) = rx.recv().await {
        if eval.handle(&msg).await {
            return;
        }
    }
    // Channel closed without a terminal message: the session or connection
    // went away. An interrupt settles before dropping the handler, so this
    // only rejects evaluations that were truly abandoned.
    if !eval.is_finished() {
        eval.shared.settle(Outcome::Aborted(
            "connection closed before evaluation completed".into(),
        ));
    }
}
