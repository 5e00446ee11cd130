//! WebSocket transport for the gateway.
//!
//! Each upgraded socket gets a connection id and a bounded outbound queue.
//! A writer task drains the queue into the socket while the reader loop
//! feeds text frames to [`Gateway::handle_text`]. Whatever ends first tears
//! the connection down through [`Gateway::close_connection`].

use super::gateway::{Flow, Gateway};
use crate::protocol::{encode, GatewayCommand};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

/// WebSocket upgrade handler mounted at the configured path.
pub async fn ws_handler(State(gateway): State<Gateway>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, gateway))
}

async fn handle_socket(socket: WebSocket, gateway: Gateway) {
    let (handle, mut outbound) = gateway.open_connection();
    let conn = handle.id();
    let (mut ws_tx, mut ws_rx) = socket.split();
    info!(%conn, "websocket connected");

    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if let Err(e) = ws_tx.send(Message::Text(frame.into())).await {
                debug!(%conn, "websocket send failed: {}", e);
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let ping_every = gateway.config().ping_interval();
    let mut ping = ping_every
        .map(|every| tokio::time::interval_at(tokio::time::Instant::now() + every, every));
    let ping_frame = encode(&GatewayCommand::Ping).ok();

    let mut voluntary = false;
    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if gateway.handle_text(&handle, text.as_str()).await == Flow::Close {
                            voluntary = true;
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        warn!(%conn, "ignoring binary frame");
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    // axum answers pings itself
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(%conn, "websocket receive failed: {}", e);
                        break;
                    }
                }
            }
            _ = async {
                match ping.as_mut() {
                    Some(interval) => { interval.tick().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {
                if gateway.is_host(conn) {
                    if let Some(frame) = ping_frame.clone() {
                        handle.try_send(frame);
                    }
                }
            }
            _ = &mut send_task => break,
        }
    }

    gateway.close_connection(conn, voluntary);
    drop(handle);
    if !send_task.is_finished() {
        // Let queued replies drain before the socket goes away.
        let _ = tokio::time::timeout(std::time::Duration::from_millis(250), &mut send_task).await;
        send_task.abort();
    }
    info!(%conn, voluntary, "websocket disconnected");
}
