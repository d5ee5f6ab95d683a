//! Connection: transport ownership, bootstrap, and message routing.
//!
//! One [`Connection`] owns exactly one TCP stream. A writer task serializes
//! all outbound messages, a reader task decodes and dispatches all inbound
//! messages, and the bootstrap handshake establishes the first session plus
//! the server's capability set before `connect` returns.
//!
//! The connection also owns the two registries the rest of the client hangs
//! off: the session registry (server session id → [`Session`]) and the
//! live-evaluation registry used for bulk interrupt. Both are plain fields
//! of the connection rather than process globals, so independent
//! connections coexist in one process and tear down deterministically.

pub(crate) mod handshake;
pub(crate) mod reader;
pub(crate) mod writer;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bencode::Value;
use crate::collab::Hooks;
use crate::config::ConnectConfig;
use crate::eval::Evaluation;
use crate::ops::{CapabilitySet, Op};
use crate::session::Session;
use crate::{Error, Result};

/// Outbound queue depth between callers and the writer task.
const OUTBOUND_QUEUE: usize = 32;

/// Lock a mutex, recovering the guard if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared connection state behind the [`Connection`] handle.
pub(crate) struct ConnInner {
    outbound: mpsc::Sender<Value>,
    ids: AtomicU64,
    capabilities: OnceLock<CapabilitySet>,
    bootstrap_ns: OnceLock<String>,
    sessions: Mutex<HashMap<String, Session>>,
    evals: Mutex<HashMap<String, Evaluation>>,
    close_listeners: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    closed: AtomicBool,
    cancel: CancellationToken,
    hooks: Hooks,
}

impl ConnInner {
    /// Next connection-wide correlation id: strictly increasing decimal
    /// strings, shared by every session, never reused.
    pub(crate) fn next_id(&self) -> String {
        let n = self.ids.fetch_add(1, Ordering::Relaxed) + 1;
        n.to_string()
    }

    /// Queue one value for the writer task.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` when the connection is already closed.
    pub(crate) async fn send(&self, value: Value) -> Result<()> {
        self.outbound
            .send(value)
            .await
            .map_err(|_| Error::Io("connection closed".into()))
    }

    pub(crate) fn capabilities(&self) -> Option<&CapabilitySet> {
        self.capabilities.get()
    }

    pub(crate) fn set_capabilities(&self, caps: CapabilitySet) {
        if self.capabilities.set(caps).is_err() {
            warn!("capability set already populated, ignoring duplicate describe");
        }
    }

    pub(crate) fn set_bootstrap_ns(&self, ns: &str) {
        let _ = self.bootstrap_ns.set(ns.to_owned());
    }

    pub(crate) fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    pub(crate) fn session(&self, id: &str) -> Option<Session> {
        lock(&self.sessions).get(id).cloned()
    }

    pub(crate) fn register_session(&self, session: Session) {
        lock(&self.sessions).insert(session.id().to_owned(), session);
    }

    pub(crate) fn remove_session(&self, id: &str) {
        lock(&self.sessions).remove(id);
    }

    pub(crate) fn register_eval(&self, eval: Evaluation) {
        lock(&self.evals).insert(eval.id().to_owned(), eval);
    }

    pub(crate) fn remove_eval(&self, id: &str) {
        lock(&self.evals).remove(id);
    }

    pub(crate) fn live_evals(&self) -> Vec<Evaluation> {
        lock(&self.evals).values().cloned().collect()
    }

    /// Forward a terminal transport failure to the caller-supplied observer.
    pub(crate) fn report_error(&self, err: &Error) {
        if let Some(cb) = &self.hooks.on_error {
            cb(err);
        }
    }

    /// Terminal teardown: idempotent fan-out of close notifications.
    ///
    /// Cancels both I/O tasks, notifies every registered session through its
    /// close listeners (no per-session close handshake is attempted), drops
    /// the live-evaluation registry, and fires the connection's own close
    /// listeners. Listener faults stay confined here and never reach the
    /// transport layer.
    pub(crate) fn shutdown(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(reason, "connection closed");
        self.cancel.cancel();

        let sessions: Vec<Session> = {
            let mut map = lock(&self.sessions);
            map.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.notify_connection_closed();
        }

        lock(&self.evals).clear();

        let listeners: Vec<Box<dyn FnOnce() + Send>> =
            lock(&self.close_listeners).drain(..).collect();
        for listener in listeners {
            listener();
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Handle to one client connection.
///
/// Cheap to clone; the last clone dropping does **not** close the socket —
/// teardown is explicit via [`Connection::close`] or transport failure.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("closed", &self.inner.is_closed())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Connect to the server and run the bootstrap handshake to completion.
    ///
    /// Returns the connection handle together with the first session. The
    /// future resolves only once the session exists **and** the capability
    /// set has been captured.
    ///
    /// # Errors
    ///
    /// - `Error::Io` — TCP connect failure or timeout.
    /// - `Error::Handshake` — bootstrap did not complete in time, or the
    ///   connection closed mid-bootstrap.
    pub async fn connect(config: &ConnectConfig, hooks: Hooks) -> Result<(Self, Session)> {
        let addr = format!("{}:{}", config.host, config.port);
        let stream = tokio::time::timeout(config.connect_timeout(), TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::Io(format!("connect timeout to {addr}")))??;
        debug!(%addr, "transport connected");

        let (read_half, write_half) = stream.into_split();
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let cancel = CancellationToken::new();

        let inner = Arc::new(ConnInner {
            outbound: out_tx,
            ids: AtomicU64::new(0),
            capabilities: OnceLock::new(),
            bootstrap_ns: OnceLock::new(),
            sessions: Mutex::new(HashMap::new()),
            evals: Mutex::new(HashMap::new()),
            close_listeners: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            cancel: cancel.clone(),
            hooks,
        });

        tokio::spawn(writer::run_writer(
            Arc::clone(&inner),
            write_half,
            out_rx,
            cancel.clone(),
        ));

        let (done_tx, done_rx) = oneshot::channel();
        let handshake = handshake::Handshake::new(Arc::clone(&inner), done_tx);
        handshake.start().await?;

        tokio::spawn(reader::run_reader(
            Arc::clone(&inner),
            read_half,
            handshake,
            cancel,
        ));

        let session = tokio::time::timeout(config.handshake_timeout(), done_rx)
            .await
            .map_err(|_| {
                Error::Handshake(format!(
                    "bootstrap did not complete within {}s",
                    config.handshake_timeout_seconds
                ))
            })?
            .map_err(|_| Error::Handshake("connection closed during bootstrap".into()))??;

        Ok((Self { inner }, session))
    }

    /// Whether the server advertises `op`.
    #[must_use]
    pub fn supports(&self, op: Op) -> bool {
        self.inner
            .capabilities()
            .is_some_and(|caps| caps.supports(op))
    }

    /// The namespace reported by the bootstrap probe, when captured.
    #[must_use]
    pub fn namespace(&self) -> Option<String> {
        self.inner.bootstrap_ns.get().cloned()
    }

    /// Look up a registered session by server-assigned id.
    #[must_use]
    pub fn session(&self, id: &str) -> Option<Session> {
        self.inner.session(id)
    }

    /// Register a listener fired exactly once when the connection closes.
    ///
    /// Runs immediately when the connection is already closed.
    pub fn on_close(&self, listener: impl FnOnce() + Send + 'static) {
        if self.inner.is_closed() {
            listener();
            return;
        }
        lock(&self.inner.close_listeners).push(Box::new(listener));
    }

    /// Interrupt every live evaluation on this connection.
    ///
    /// Snapshot semantics: evaluations created after the call starts are
    /// untouched. Per-item failures are logged and do not abort the rest.
    /// Returns the number of evaluations an interrupt was attempted for.
    pub async fn interrupt_all(&self) -> usize {
        let snapshot = self.inner.live_evals();
        let mut attempted = 0;
        for eval in snapshot {
            if eval.is_finished() || eval.is_interrupted() {
                continue;
            }
            attempted += 1;
            if let Err(err) = eval.interrupt().await {
                warn!(id = eval.id(), %err, "bulk interrupt: per-evaluation failure");
            }
        }
        attempted
    }

    /// Close the connection locally: cancel both I/O tasks and fan out
    /// close notifications to every session and listener.
    pub fn close(&self) {
        self.inner.shutdown("closed by client");
    }

    /// Whether the connection has been torn down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}
