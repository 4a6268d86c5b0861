//! axum WebSocket transport for [`StreamingProtocolHandler`].

use crate::server::AppState;
use crate::server::handler::{Inbound, Outbound, StreamingProtocolHandler};
use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Frames read ahead of the handler.
const INBOUND_BUFFER: usize = 256;

pub async fn transcribe(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

pub async fn serve_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();

    let mut handler = tokio::spawn(StreamingProtocolHandler::new(state, out_tx).run(inbound_rx));

    let writer = tokio::spawn(async move {
        while let Some(item) = out_rx.recv().await {
            let frame = match item {
                Outbound::Message(message) => match message.to_json() {
                    Ok(json) => Message::Text(json),
                    Err(e) => {
                        error!(error = %e, "cannot encode server message");
                        continue;
                    }
                },
                Outbound::Close { code, reason } => {
                    let close = Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    }));
                    if sink.send(close).await.is_err() {
                        debug!("client gone before close frame");
                    }
                    break;
                }
            };
            if sink.send(frame).await.is_err() {
                debug!("client gone, writer stopping");
                break;
            }
        }
    });

    let mut handler_done = false;
    loop {
        tokio::select! {
            _ = &mut handler => {
                handler_done = true;
                break;
            }
            frame = stream.next() => {
                let inbound = match frame {
                    Some(Ok(Message::Text(text))) => Inbound::Text(text),
                    Some(Ok(Message::Binary(bytes))) => Inbound::Binary(bytes),
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => Inbound::Closed,
                    Some(Err(e)) => {
                        debug!(error = %e, "websocket read failed");
                        Inbound::Closed
                    }
                };
                let closed = inbound == Inbound::Closed;
                if inbound_tx.send(inbound).await.is_err() || closed {
                    break;
                }
            }
        }
    }

    drop(inbound_tx);
    if !handler_done && let Err(e) = handler.await {
        error!(error = %e, "connection handler panicked");
    }
    if let Err(e) = writer.await {
        error!(error = %e, "connection writer panicked");
    }
}
