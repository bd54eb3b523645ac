//! WebSocket handler for live change notifications.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::websocket::{encode, reply_to, ConnectionManager};

/// Serve one live connection until the client goes away.
///
/// Outgoing frames are funneled through a channel so that notifications
/// from push handlers and replies to this client share one writer.
pub async fn handle_websocket_connection(
    socket: WebSocket,
    conn_manager: Arc<ConnectionManager>,
    collection: String,
    owner_id: String,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn_id = conn_manager.register(&collection, &owner_id, tx);

    let send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let Some(text) = encode(&message) else { continue };
            if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                tracing::warn!(error = %e, "failed to send live message");
                break;
            }
        }
    });

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                conn_manager.send_to(&conn_id, reply_to(text.as_str()));
            }
            Ok(Message::Binary(_)) => {
                tracing::warn!(conn_id = %conn_id, "binary live frame ignored");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::warn!(conn_id = %conn_id, error = %e, "live connection failed");
                break;
            }
        }
    }

    conn_manager.unregister(&conn_id);
    send_task.abort();

    tracing::info!(
        conn_id = %conn_id,
        active_connections = conn_manager.connection_count(),
        "live client disconnected"
    );
}
