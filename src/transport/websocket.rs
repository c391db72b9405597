//! WebSocket transport
//!
//! One task per accepted connection:
//! - perform the handshake, remembering the client's `User-Agent`
//! - register the connection with the broker, which queues the welcome frame
//! - spawn a writer that drains the connection's outbound queue into the socket
//! - feed every inbound text frame to `dispatch::handle_text`
//!
//! When the socket closes or fails the connection is disconnected from the
//! broker, which releases all of its topic and channel subscriptions.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::protocol::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::broker::message::error_envelope;
use crate::client::PeerInfo;
use crate::transport::dispatch::{ServerContext, handle_text};
use crate::utils::error::{EngineError, ProtocolError};

/// Bind `addr` and serve connections until the listener fails.
pub async fn start_websocket_server(addr: &str, ctx: ServerContext) -> Result<(), EngineError> {
    let listener = TcpListener::bind(addr).await?;
    info!("WebSocket server listening on ws://{}", listener.local_addr()?);
    serve(listener, ctx).await;
    Ok(())
}

/// Accept connections from an already bound listener.
pub async fn serve(listener: TcpListener, ctx: ServerContext) {
    loop {
        match listener.accept().await {
            Ok((stream, address)) => {
                tokio::spawn(handle_connection(stream, address, ctx.clone()));
            }
            Err(e) => warn!(error = %e, "failed to accept connection"),
        }
    }
}

async fn handle_connection(stream: TcpStream, address: SocketAddr, ctx: ServerContext) {
    let mut user_agent = None;
    let capture = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        user_agent = request
            .headers()
            .get("user-agent")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        Ok(response)
    };

    let ws_stream = match accept_hdr_async(stream, capture).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%address, error = %e, "WebSocket handshake failed");
            return;
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let peer = PeerInfo {
        address: Some(address),
        user_agent,
    };
    let (id, outbound) = match ctx.broker.connect(peer) {
        Ok(accepted) => accepted,
        Err(e) => {
            warn!(%address, error = %e, "connection refused");
            if let Ok(text) = error_envelope(e.to_string()).to_json() {
                let _ = ws_sender.send(WsMessage::text(text)).await;
            }
            let _ = ws_sender.close().await;
            return;
        }
    };

    let writer = tokio::spawn(write_loop(id.clone(), outbound, ws_sender));

    while let Some(frame) = ws_receiver.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => handle_text(&ctx, &id, text.as_str()),
            Ok(WsMessage::Binary(_)) => {
                let e = ProtocolError::Malformed("binary frames are not supported".to_string());
                let _ = ctx.broker.send_to(&id, &error_envelope(e.to_string()));
            }
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(connection = %id, error = %e, "read failed");
                break;
            }
        }
    }

    ctx.broker.disconnect(&id);
    // the broker dropped its queue senders, so the writer drains and exits
    if let Err(e) = writer.await {
        debug!(connection = %id, error = %e, "writer task ended abnormally");
    }
}

async fn write_loop<S>(id: String, mut outbound: mpsc::Receiver<WsMessage>, mut sink: S)
where
    S: futures_util::Sink<WsMessage> + Unpin,
    S::Error: std::fmt::Display,
{
    while let Some(message) = outbound.recv().await {
        if let Err(e) = sink.send(message).await {
            debug!(connection = %id, error = %e, "send failed");
            break;
        }
    }
    let _ = sink.close().await;
    debug!(connection = %id, "send loop closed");
}
