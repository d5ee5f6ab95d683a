//! Inbound reader task.
//!
//! Drives a [`FramedRead`] over the transport using [`BencodeCodec`] and
//! dispatches each decoded message:
//!
//! 1. While the bootstrap handshake is incomplete, messages whose
//!    correlation id belongs to the handshake are routed to its state
//!    machine (session routing is impossible before the first session
//!    exists).
//! 2. Everything else is routed by its `session` field to the matching
//!    registered session's intake; messages without a recognized session
//!    are dropped at `DEBUG`.
//!
//! EOF and transport errors are terminal for the connection: the error hook
//! observes them and close notifications fan out to every session. A decode
//! error also ends the connection — once the byte stream is desynchronized
//! there is no frame boundary left to resynchronize on.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bencode::{BencodeCodec, Value};
use crate::connection::handshake::Handshake;
use crate::connection::ConnInner;
use crate::message::Message;
use crate::Error;

/// Reader task — decodes inbound frames and dispatches them.
pub(crate) async fn run_reader<R>(
    conn: Arc<ConnInner>,
    source: R,
    mut handshake: Handshake,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(source, BencodeCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("reader: cancellation received, stopping");
                break;
            }

            item = framed.next() => {
                match item {
                    None => {
                        debug!("reader: EOF detected");
                        conn.report_error(&Error::Io("stream closed".into()));
                        conn.shutdown("stream closed");
                        break;
                    }

                    Some(Err(err)) => {
                        warn!(%err, "reader: transport or decode error, stopping");
                        conn.report_error(&err);
                        conn.shutdown("stream error");
                        break;
                    }

                    Some(Ok(value)) => {
                        dispatch(&conn, &mut handshake, value).await;
                    }
                }
            }
        }
    }

    // Covers the cancellation path; a no-op when shutdown already ran.
    conn.shutdown("reader stopped");
}

/// Route one decoded frame to the handshake or the owning session.
async fn dispatch(conn: &Arc<ConnInner>, handshake: &mut Handshake, value: Value) {
    let Some(msg) = Message::from_value(value) else {
        warn!("reader: dropping non-dictionary frame");
        return;
    };

    if !handshake.is_complete() && msg.id().is_some_and(|id| handshake.owns(id)) {
        handshake.on_message(&msg).await;
        return;
    }

    match msg.session().and_then(|sid| conn.session(sid)) {
        Some(session) => session.on_message(msg),
        None => {
            debug!(
                id = msg.id().unwrap_or(""),
                "reader: dropping message without a recognized session"
            );
        }
    }
}
