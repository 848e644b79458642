//! WebSocket echo endpoint.
//!
//! Echoes text and binary messages back to the sender. Message size limits come
//! from the listener the connection arrived on.

use axum::extract::ws::{Message, WebSocket};
use axum::response::Response;
use futures::{SinkExt, StreamExt};

use crate::http::WsUpgrade;

pub async fn echo(WsUpgrade(upgrade): WsUpgrade) -> Response {
    upgrade.on_upgrade(handle_socket)
}

async fn handle_socket(socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();

    while let Some(message) = receiver.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(error = %e, "WebSocket receive failed");
                break;
            }
        };

        let reply = match message {
            Message::Text(_) | Message::Binary(_) => message,
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        if let Err(e) = sender.send(reply).await {
            tracing::debug!(error = %e, "WebSocket send failed");
            break;
        }
    }

    tracing::debug!("WebSocket connection closed");
}
