//! Per-listener WebSocket lifecycle
//!
//! `connecting → open → closing → closed`: the upgrade completes, the
//! connection is registered and welcomed, pings are answered, and on close,
//! error, write timeout or keepalive timeout it is unregistered again.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::hub::{BroadcastHub, ConnectionId, Outbound};
use crate::notify::protocol::{ClientMessage, ControlMessage, ServerMessage};

/// Timing knobs for a single connection
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    /// Close the connection when nothing arrives for this long
    pub keepalive_timeout: Duration,
    /// Close the connection when a single write takes longer than this
    pub write_timeout: Duration,
}

/// Why a connection left the open state
#[derive(Debug, Clone, PartialEq, Eq)]
enum CloseCause {
    RemoteClosed,
    TransportError(String),
    KeepaliveTimeout,
    WriterStopped,
}

/// Drive one upgraded WebSocket until it closes
pub async fn handle_socket(
    socket: WebSocket,
    peer: SocketAddr,
    hub: Arc<BroadcastHub>,
    settings: ConnectionSettings,
) {
    let (mut sink, mut stream) = socket.split();

    let registration = match hub.register(peer.to_string()) {
        Ok(registration) => registration,
        Err(e) => {
            tracing::info!(%peer, "Refusing listener: {}", e);
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: axum::extract::ws::close_code::AWAY,
                    reason: "Server shutting down".into(),
                })))
                .await;
            return;
        }
    };
    let id = registration.id;

    // 接続したクライアントにだけウェルカムメッセージを送る
    hub.send_to(id, &ServerMessage::Control(ControlMessage::connected()));

    let mut writer = tokio::spawn(write_loop(id, sink, registration.outbound, settings.write_timeout));

    let cause = loop {
        tokio::select! {
            frame = tokio::time::timeout(settings.keepalive_timeout, stream.next()) => {
                match frame {
                    Err(_) => break CloseCause::KeepaliveTimeout,
                    Ok(None) => break CloseCause::RemoteClosed,
                    Ok(Some(Err(e))) => break CloseCause::TransportError(e.to_string()),
                    Ok(Some(Ok(Message::Close(_)))) => break CloseCause::RemoteClosed,
                    Ok(Some(Ok(Message::Text(text)))) => handle_text(&hub, id, text.as_str()),
                    // Protocol-level pings are answered by axum; any frame counts as liveness
                    Ok(Some(Ok(_))) => {}
                }
            }
            _ = &mut writer => break CloseCause::WriterStopped,
        }
    };

    match &cause {
        CloseCause::TransportError(e) => tracing::warn!(%id, %peer, "Listener transport error: {}", e),
        CloseCause::KeepaliveTimeout => tracing::info!(%id, %peer, "Listener keepalive timed out"),
        other => tracing::debug!(%id, %peer, ?other, "Listener closing"),
    }

    hub.mark_closing(id);
    hub.unregister(id);
    // Unregistering dropped the queue's sender; the writer flushes what's left and ends
    if !writer.is_finished() {
        let _ = tokio::time::timeout(settings.write_timeout, &mut writer).await;
        writer.abort();
    }
}

fn handle_text(hub: &BroadcastHub, id: ConnectionId, text: &str) {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Ping) => {
            hub.send_to(id, &ServerMessage::Control(ControlMessage::pong()));
        }
        Err(e) => {
            tracing::debug!(%id, "Ignoring unrecognized listener frame: {}", e);
        }
    }
}

async fn write_loop(
    id: ConnectionId,
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
    write_timeout: Duration,
) {
    while let Some(frame) = outbound.recv().await {
        let (message, last) = match frame {
            Outbound::Text(text) => (Message::Text(text.into()), false),
            Outbound::Close { code, reason } => (
                Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })),
                true,
            ),
        };

        match tokio::time::timeout(write_timeout, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(%id, "Write failed: {}", e);
                return;
            }
            Err(_) => {
                tracing::warn!(%id, "Write timed out after {:?}", write_timeout);
                return;
            }
        }
        if last {
            return;
        }
    }
    let _ = sink.close().await;
}
