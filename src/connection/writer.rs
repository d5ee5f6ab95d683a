//! Outbound writer task.
//!
//! Receives encoded-ready [`Value`]s from a tokio [`mpsc`] channel and sinks
//! them into the transport through [`FramedWrite`] backed by
//! [`BencodeCodec`]. All outbound traffic for the connection — handshake,
//! session requests, interrupts — funnels through this one task, so writes
//! are naturally serialized without a lock around the socket.

use std::sync::Arc;

use futures_util::SinkExt;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bencode::{BencodeCodec, Value};
use crate::connection::ConnInner;

/// Writer task — encodes outbound values and writes them to the transport.
///
/// Exits cleanly when `cancel` fires or when `msg_rx` is closed (all senders
/// dropped). A write failure is terminal for the whole connection: it is
/// reported through the error hook and triggers connection shutdown.
pub(crate) async fn run_writer<W>(
    conn: Arc<ConnInner>,
    sink: W,
    mut msg_rx: mpsc::Receiver<Value>,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin + Send,
{
    let mut framed = FramedWrite::new(sink, BencodeCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("writer: cancellation received, stopping");
                break;
            }

            msg = msg_rx.recv() => {
                match msg {
                    None => {
                        debug!("writer: message channel closed, stopping");
                        break;
                    }
                    Some(value) => {
                        if let Err(err) = framed.send(value).await {
                            warn!(%err, "writer: write to transport failed");
                            conn.report_error(&err);
                            conn.shutdown("write failed");
                            break;
                        }
                    }
                }
            }
        }
    }
}
