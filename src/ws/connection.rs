//! WebSocket connection lifecycle.
//!
//! Wires one socket to the delivery engine: registers the connection with
//! a bounded outbound queue, spawns a writer task that drains the queue
//! into the socket sink, and runs the read loop until the client leaves.
//! The writer task is the only place a socket write can block, so
//! backpressure from a slow client never holds a registry lock.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::service::engine::{RealtimeEngine, reason};

/// Runs the read loop for a single WebSocket connection.
///
/// Registration failures close the socket immediately. Everything else
/// ends in exactly one `disconnect` call; concurrent disconnects from the
/// liveness monitor or a failed delivery resolve to a no-op here.
pub async fn run_connection(socket: WebSocket, engine: Arc<RealtimeEngine>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (outbound_tx, mut outbound_rx) =
        mpsc::channel(engine.config().outbound_queue_capacity.max(1));
    let connection_id = match engine.register_connection(outbound_tx).await {
        Ok(id) => id,
        Err(err) => {
            tracing::error!(error = %err, "connection registration failed");
            return;
        }
    };

    // Writer task: drains the outbound queue into the socket. Exits when
    // every sender is gone (the connection record was removed) after
    // flushing whatever is still queued.
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if ws_tx.send(Message::text(message.to_wire())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let mut close_reason = reason::CLIENT_DISCONNECT;
    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                engine.handle_text(connection_id, &text).await;
            }
            Ok(Message::Close(_)) => break,
            // Binary frames are not part of the protocol; control frames
            // are answered by axum itself.
            Ok(_) => {}
            Err(_) => {
                close_reason = reason::TRANSPORT_ERROR;
                break;
            }
        }
    }

    engine.disconnect(connection_id, close_reason).await;
    let _ = writer.await;
    tracing::debug!(connection = %connection_id, "ws connection closed");
}
