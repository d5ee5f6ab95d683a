//! Connect-time bootstrap handshake.
//!
//! After the TCP stream is up, the client performs a fixed three-step
//! exchange before any caller-visible session exists:
//!
//! 1. **namespace probe** — an `eval` of a trivial namespace-reporting
//!    expression; the `ns` field of its responses records the server's
//!    startup namespace.
//! 2. **`clone`** — sent once the probe's terminal message arrives; its
//!    response names the first session.
//! 3. **`describe`** — sent (verbose, scoped to the new session) as soon as
//!    the session is constructed; its `ops` dictionary becomes the
//!    connection's capability set.
//!
//! The connect future resolves only once **both** the first session exists
//! **and** the capability set is populated. Responses may race, so both
//! conditions are re-checked after every update rather than assuming the
//! describe response arrives last.

use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::connection::ConnInner;
use crate::message::Message;
use crate::ops::{CapabilitySet, Op};
use crate::session::Session;
use crate::{Error, Result};

/// Expression evaluated by the namespace probe.
const NS_PROBE_CODE: &str = "(str *ns*)";

/// Bootstrap stage progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    AwaitNs,
    AwaitClone,
    AwaitDescribe,
    Complete,
}

/// Bootstrap handshake state machine.
///
/// Lives inside the reader task until complete; messages are routed here by
/// connection-wide correlation id because session routing cannot occur
/// before the first session exists.
pub(crate) struct Handshake {
    conn: Arc<ConnInner>,
    stage: Stage,
    probe_id: String,
    clone_id: Option<String>,
    describe_id: Option<String>,
    session: Option<Session>,
    done: Option<oneshot::Sender<Result<Session>>>,
}

impl Handshake {
    /// Build the state machine; ids are drawn from the connection-wide
    /// generator so they can never collide with later requests.
    pub(crate) fn new(conn: Arc<ConnInner>, done: oneshot::Sender<Result<Session>>) -> Self {
        let probe_id = conn.next_id();
        Self {
            conn,
            stage: Stage::AwaitNs,
            probe_id,
            clone_id: None,
            describe_id: None,
            session: None,
            done: Some(done),
        }
    }

    /// Send the namespace probe, entering the first stage.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the outbound channel is already closed.
    pub(crate) async fn start(&self) -> Result<()> {
        let msg = Message::request(Op::Eval, &self.probe_id).field("code", NS_PROBE_CODE);
        self.conn.send(msg.into_value()).await?;
        debug!(id = %self.probe_id, "handshake: namespace probe sent");
        Ok(())
    }

    /// Whether bootstrap has finished (successfully or not).
    pub(crate) fn is_complete(&self) -> bool {
        self.stage == Stage::Complete
    }

    /// Whether `id` was issued by this handshake.
    pub(crate) fn owns(&self, id: &str) -> bool {
        id == self.probe_id
            || self.clone_id.as_deref() == Some(id)
            || self.describe_id.as_deref() == Some(id)
    }

    /// Advance the state machine on one inbound message.
    pub(crate) async fn on_message(&mut self, msg: &Message) {
        match self.stage {
            Stage::AwaitNs => self.on_probe_message(msg).await,
            Stage::AwaitClone => self.on_clone_message(msg).await,
            Stage::AwaitDescribe => self.on_describe_message(msg),
            Stage::Complete => {}
        }
    }

    async fn on_probe_message(&mut self, msg: &Message) {
        if let Some(ns) = msg.get_str("ns") {
            self.conn.set_bootstrap_ns(ns);
        }
        if !msg.is_terminal() {
            return;
        }

        let clone_id = self.conn.next_id();
        let clone_msg = Message::request(Op::Clone, &clone_id);
        self.clone_id = Some(clone_id);
        self.stage = Stage::AwaitClone;
        if let Err(err) = self.conn.send(clone_msg.into_value()).await {
            self.fail(err);
        }
    }

    async fn on_clone_message(&mut self, msg: &Message) {
        let Some(session_id) = msg.new_session() else {
            warn!("handshake: clone response without new-session field, waiting");
            return;
        };

        let session = Session::new(Arc::clone(&self.conn), session_id);
        self.conn.register_session(session.clone());
        self.session = Some(session);
        debug!(session_id, "handshake: first session established");

        let describe_id = self.conn.next_id();
        let describe_msg = Message::request(Op::Describe, &describe_id)
            .field("session", session_id)
            .field("verbose?", "true");
        self.describe_id = Some(describe_id);
        self.stage = Stage::AwaitDescribe;
        if let Err(err) = self.conn.send(describe_msg.into_value()).await {
            self.fail(err);
            return;
        }

        self.check_complete();
    }

    fn on_describe_message(&mut self, msg: &Message) {
        if msg.get("ops").is_some() {
            let caps = CapabilitySet::from_describe(msg);
            debug!(op_count = caps.len(), "handshake: capability set captured");
            self.conn.set_capabilities(caps);
        }
        self.check_complete();
    }

    /// Resolve the connect future once the session and the capability set
    /// both exist.
    fn check_complete(&mut self) {
        if self.session.is_none() || self.conn.capabilities().is_none() {
            return;
        }
        self.stage = Stage::Complete;
        if let (Some(done), Some(session)) = (self.done.take(), self.session.clone()) {
            info!(session_id = session.id(), "handshake: bootstrap complete");
            let _ = done.send(Ok(session));
        }
    }

    fn fail(&mut self, err: Error) {
        self.stage = Stage::Complete;
        if let Some(done) = self.done.take() {
            let _ = done.send(Err(err));
        }
    }
}
