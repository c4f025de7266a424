//! Per-connection WebSocket handling
//!
//! Each socket gets a reader loop (this task) and a writer task that drains
//! the connection's outbound queue. The relay decides what to send; this
//! module only moves frames and maps close reasons to close codes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{StatusCode, Uri};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::accept_hdr_async;
use tracing::{debug, info, warn};
use url::form_urlencoded;

use super::protocol::ServerFrame;
use crate::relay::{CloseReason, ConversationId, Outbound, Relay, RelayError};

/// Path prefix of the relay endpoint
pub const WS_PATH_PREFIX: &str = "/ws/";

/// Where a client asked to connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsTarget {
    pub conversation_id: ConversationId,
    pub token: Option<String>,
}

/// Parse `/ws/{conversation_id}?token=...`
///
/// Returns `None` for any other path. A missing token is not a parse error;
/// the relay rejects it after the upgrade so the client sees close code 1008.
pub fn parse_ws_target(uri: &Uri) -> Option<WsTarget> {
    let conversation_id = uri
        .path()
        .strip_prefix(WS_PATH_PREFIX)?
        .parse::<ConversationId>()
        .ok()?;

    let token = uri.query().and_then(|query| {
        form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == "token")
            .map(|(_, value)| value.into_owned())
    });

    Some(WsTarget {
        conversation_id,
        token,
    })
}

fn not_found() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("Not Found".to_string()));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}

fn close_frame(code: CloseCode, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

/// Close code and reason sent for a server-side close, if any
pub fn close_code_for(reason: CloseReason) -> Option<(CloseCode, &'static str)> {
    match reason {
        CloseReason::QueueFull | CloseReason::WriteTimeout => Some((CloseCode::Again, "too slow")),
        CloseReason::Removed => Some((CloseCode::Normal, "removed from conversation")),
        CloseReason::Shutdown => Some((CloseCode::Away, "server shutting down")),
        CloseReason::PeerClosed => None,
    }
}

/// Handle a single WebSocket connection from handshake to close
pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    relay: Arc<Relay>,
    send_timeout: Duration,
) -> anyhow::Result<()> {
    debug!("New connection from {}", peer_addr);

    let mut target = None;
    let mut ws_stream = accept_hdr_async(stream, |request: &Request, response: Response| {
        match parse_ws_target(request.uri()) {
            Some(parsed) => {
                target = Some(parsed);
                Ok(response)
            }
            None => {
                debug!("Refusing upgrade for {} from {}", request.uri().path(), peer_addr);
                Err(not_found())
            }
        }
    })
    .await?;

    let Some(target) = target else {
        return Ok(());
    };

    let (connection, outbound) = match relay
        .connect(target.conversation_id, target.token.as_deref())
        .await
    {
        Ok(accepted) => accepted,
        Err(e) => {
            let frame = match e {
                RelayError::Unauthorized => {
                    info!(
                        conversation_id = target.conversation_id,
                        "Rejected connection from {}: invalid token", peer_addr
                    );
                    close_frame(CloseCode::Policy, "invalid token")
                }
                other => {
                    warn!("Could not admit connection from {}: {}", peer_addr, other);
                    close_frame(CloseCode::Error, "service unavailable")
                }
            };
            let _ = tokio::time::timeout(send_timeout, ws_stream.send(frame)).await;
            return Ok(());
        }
    };

    let (ws_sender, mut ws_receiver) = ws_stream.split();
    let writer = tokio::spawn(write_loop(ws_sender, outbound, send_timeout));

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match relay.on_message(&connection, &text).await {
                            Ok(delivery) => {
                                debug!(
                                    conversation_id = connection.conversation_id(),
                                    message_id = %delivery.message_id,
                                    delivered = delivery.delivered,
                                    dropped = delivery.dropped.len(),
                                    "Message relayed"
                                );
                            }
                            Err(e) => {
                                debug!(connection_id = %connection.id(), "Message rejected: {}", e);
                                connection.reply(&ServerFrame::from(&e));
                            }
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        warn!("Received binary message from {} ({} bytes), ignoring", peer_addr, data.len());
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Connection closed by {}", peer_addr);
                        break;
                    }
                    Some(Ok(_)) => {
                        // Ping/pong are answered by tungstenite
                    }
                    Some(Err(e)) => {
                        debug!("WebSocket error from {}: {}", peer_addr, e);
                        break;
                    }
                }
            }
            _ = connection.closed() => {
                break;
            }
        }
    }

    relay.on_disconnect(&connection);
    connection.close(CloseReason::PeerClosed);
    let _ = writer.await;

    debug!("Connection from {} finished", peer_addr);
    Ok(())
}

/// Drain the outbound queue into the socket until the connection closes
async fn write_loop<S>(mut sink: S, mut outbound: Outbound, send_timeout: Duration)
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    loop {
        tokio::select! {
            biased;
            _ = outbound.closer.closed() => break,
            frame = outbound.receiver.recv() => {
                let Some(json) = frame else { break };
                match tokio::time::timeout(send_timeout, sink.send(Message::Text(json))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!("Write failed: {}", e);
                        outbound.closer.close(CloseReason::PeerClosed);
                        break;
                    }
                    Err(_) => {
                        warn!("Write timed out after {:?}, closing connection", send_timeout);
                        outbound.closer.close(CloseReason::WriteTimeout);
                        break;
                    }
                }
            }
        }
    }

    if let Some((code, reason)) = outbound.closer.reason().and_then(close_code_for) {
        let _ = tokio::time::timeout(send_timeout, sink.send(close_frame(code, reason))).await;
    }
}
