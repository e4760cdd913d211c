//! WebSocket transport for cluster connections.
//!
//! Each accepted socket is split into a read loop, which feeds text frames
//! into a [`Connection`], and a writer task draining the connection's
//! outbox. The writer stops after the first close frame.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use coordination::{
    ClusterLink, CloseCode, CloseFrame, Connection, ConnectionState, Outbound, Outbox,
    SharedCoordinator,
};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as WsCloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// How long a peer gets to answer our close frame before the socket is dropped.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Accept connections until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    coordinator: SharedCoordinator,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<()> {
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        continue;
                    }
                };
                debug!(peer = %peer, "Connection accepted");
                let coordinator = coordinator.clone();
                tokio::spawn(async move {
                    handle_socket(stream, peer, coordinator).await;
                });
            }
            _ = &mut shutdown => {
                info!("Shutdown requested, no longer accepting clusters");
                return Ok(());
            }
        }
    }
}

async fn handle_socket(stream: TcpStream, peer: SocketAddr, coordinator: SharedCoordinator) {
    let ws_stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(peer = %peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };
    let (write_half, mut read_half) = ws_stream.split();
    let (outbox, rx) = Outbox::channel();
    let mut writer = tokio::spawn(write_loop(write_half, rx));

    let mut conn = Connection::new(coordinator, outbox, peer.to_string());
    conn.on_open();
    let link = conn.link().cloned();

    let mut peer_close = None;
    let mut clean = false;
    let mut transport_ended = false;
    loop {
        let frame = tokio::select! {
            biased;
            _ = closed_by_server(link.as_deref()) => break,
            frame = read_half.next() => frame,
        };
        let message = match frame {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                debug!(identifier = %conn.identifier(), error = %e, "Read failed");
                transport_ended = true;
                break;
            }
            None => {
                transport_ended = true;
                break;
            }
        };
        match message {
            Message::Text(text) => conn.on_message(&text).await,
            Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                Ok(text) => conn.on_message(&text).await,
                Err(_) => conn.on_message("").await,
            },
            // tungstenite answers pings itself on the next write or flush
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            Message::Close(frame) => {
                clean = true;
                peer_close = frame.map(|f| {
                    CloseFrame::new(CloseCode::from(u16::from(f.code)), f.reason.to_string())
                });
                break;
            }
        }
    }

    // Having sent our own close, the transport ending is the expected outcome.
    let closed_by_us = conn.state() == ConnectionState::Closed;
    if closed_by_us && !clean && !transport_ended {
        // A dead peer never answers the close handshake.
        let answered = timeout(CLOSE_TIMEOUT, async {
            while let Some(Ok(message)) = read_half.next().await {
                if let Message::Close(_) = message {
                    break;
                }
            }
        })
        .await;
        if answered.is_err() {
            debug!(identifier = %conn.identifier(), "Peer did not answer close, dropping transport");
        }
    }
    conn.on_close(clean || closed_by_us, peer_close);
    drop(conn);
    drop(link);
    drop(read_half);

    match timeout(CLOSE_TIMEOUT, &mut writer).await {
        Ok(Err(e)) => debug!(peer = %peer, error = %e, "Writer task ended abnormally"),
        Ok(Ok(())) => {}
        Err(_) => writer.abort(),
    }
}

/// Resolves once this side has closed the connection. A refused handshake
/// has no link and counts as closed.
async fn closed_by_server(link: Option<&ClusterLink>) {
    if let Some(link) = link {
        link.closed().await;
    }
}

async fn write_loop(
    mut write_half: futures::stream::SplitSink<WebSocketStream<TcpStream>, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(frame) = rx.recv().await {
        let (message, last) = match frame {
            Outbound::Text(text) => (Message::Text(text.into()), false),
            Outbound::Close(close) => (
                Message::Close(Some(WsCloseFrame {
                    code: WsCloseCode::from(close.code.code()),
                    reason: close.reason.into(),
                })),
                true,
            ),
        };
        if write_half.send(message).await.is_err() {
            break;
        }
        if last {
            break;
        }
    }
    let _ = write_half.close().await;
}
