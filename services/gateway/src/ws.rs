//! The `/ws` upgrade handler and the per-connection task.
//!
//! Each connection is driven by a single task that multiplexes two duties
//! behind one `tokio::select!`: draining the socket's inbound frames and
//! draining the connection's outgoing send queue, plus a heartbeat tick and
//! the connection's close signal. Splitting those into a separate reader
//! task and writer task buys nothing here, since both duties need to
//! observe the same idle timer and the same close signal anyway.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use fanout_protocol::{message_type, ClientMessage, Envelope, ErrorPayload, ReplayMiss, SubscriptionAck};
use serde::Deserialize;
use tracing::{info, warn};

use crate::client_ip::ClientIp;
use crate::connection::Connection;
use crate::error::Error;
use crate::error_codes;
use crate::AppState;

/// Client control messages are small JSON objects; anything past this is
/// either abuse or a misbehaving client and is rejected at the protocol
/// layer rather than allocated.
const MAX_CLIENT_FRAME_BYTES: usize = 64 * 1024;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// Plug-in point for token validation. The core contract only requires that
/// a token be accepted and handed to this hook; it does not mandate any
/// particular auth scheme, so the default implementation admits everything,
/// including a missing token.
fn authenticate(_token: Option<&str>) -> Result<(), Error> {
    Ok(())
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ClientIp(ip): ClientIp,
) -> impl IntoResponse {
    if let Err(e) = state.hub.admit(ip) {
        return e.into_response();
    }
    if let Err(e) = authenticate(query.token.as_deref()) {
        return e.into_response();
    }
    ws.max_message_size(MAX_CLIENT_FRAME_BYTES)
        .max_frame_size(MAX_CLIENT_FRAME_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, state, ip))
        .into_response()
}

async fn handle_socket(mut socket: WebSocket, state: AppState, ip: std::net::IpAddr) {
    let id = state.hub.registry.reserve_id();
    let (conn, mut outgoing) = Connection::new(id, ip);
    let conn = std::sync::Arc::new(conn);
    state.hub.registry.register(std::sync::Arc::clone(&conn));
    crate::metrics::record_connection_accepted();
    info!(connection_id = id, %ip, "connection established");

    let mut heartbeat = tokio::time::interval(state.config.ping_interval);
    heartbeat.tick().await;

    // `None` means the connection already sent its own close frame (the
    // malformed-JSON path) or the peer is the one going away, and no
    // further frame should be written to the socket.
    let exit_error: Option<Error> = loop {
        tokio::select! {
            frame = socket.recv() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        conn.touch();
                        if !handle_client_text(&conn, &mut socket, &text).await {
                            break None;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        conn.touch();
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break Some(Error::TransientNetwork("pong write failed".into()));
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        conn.touch();
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break None;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        warn!(connection_id = id, "dropping unsupported binary frame");
                    }
                    Some(Err(e)) => {
                        warn!(connection_id = id, error = %e, "websocket read error");
                        break Some(Error::TransientNetwork(e.to_string()));
                    }
                }
            }
            outgoing_message = outgoing.recv() => {
                match outgoing_message {
                    Some(message) => {
                        if socket.send(message).await.is_err() {
                            break Some(Error::TransientNetwork("write failed".into()));
                        }
                    }
                    None => break Some(Error::TransientNetwork("outgoing queue closed unexpectedly".into())),
                }
            }
            _ = heartbeat.tick() => {
                if conn.idle_for() >= state.config.pong_timeout {
                    warn!(connection_id = id, "client missed pong deadline, closing");
                    break Some(Error::SlowClient);
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break Some(Error::TransientNetwork("ping write failed".into()));
                }
            }
            _ = conn.wait_for_close_signal() => {
                // Set by a saturated critical-priority enqueue (see
                // `Connection::enqueue_with_timeout`) or by the hub's
                // shutdown sweep; only the former is a client-at-fault
                // disconnect worth a non-default close code.
                break conn.is_slow().then_some(Error::SlowClient);
            }
        }
    };

    if let Some(err) = exit_error {
        let reason = err.close_reason();
        let _ = socket
            .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                code: reason.code(),
                reason: reason.reason().into(),
            })))
            .await;
    }

    conn.mark_closed();
    state.hub.registry.unregister(id);
    info!(connection_id = id, "connection closed");
}

/// Handles one inbound text frame. Returns `false` when the connection
/// should be torn down (a protocol violation the client can't recover
/// from within this session).
async fn handle_client_text(conn: &Connection, socket: &mut WebSocket, text: &str) -> bool {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            // Terminal path: the connection is going away immediately, so
            // these two frames are written straight to the socket rather
            // than through the outgoing queue — there is no "next queued
            // broadcast" left for them to race.
            let _ = send_error_direct(conn, socket, error_codes::PROTOCOL_ERROR, &e.to_string(), false).await;
            let reason = Error::ProtocolViolation(e.to_string()).close_reason();
            let _ = socket
                .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                    code: reason.code(),
                    reason: reason.reason().into(),
                })))
                .await;
            return false;
        }
    };

    match message {
        ClientMessage::Subscribe { data } => {
            let outcome = conn.subscriptions.add_all(&data.channels);
            let ack = SubscriptionAck {
                count: outcome.accepted.len(),
                channels: outcome.accepted,
            };
            enqueue_envelope(conn, message_type::SUBSCRIPTION_ACK, &ack);
            if !outcome.rejected.is_empty() {
                let payload = ErrorPayload {
                    code: error_codes::INVALID_CHANNEL,
                    message: format!("rejected channels: {}", outcome.rejected.join(", ")),
                    retryable: false,
                };
                enqueue_envelope(conn, message_type::ERROR, &payload);
            }
            true
        }
        ClientMessage::Unsubscribe { data } => {
            let removed = conn.subscriptions.remove_all(&data.channels);
            let ack = SubscriptionAck {
                count: removed.len(),
                channels: removed,
            };
            enqueue_envelope(conn, message_type::UNSUBSCRIPTION_ACK, &ack);
            true
        }
        ClientMessage::Heartbeat => {
            enqueue_envelope(conn, message_type::PONG, &serde_json::json!({}));
            true
        }
        ClientMessage::Replay { data } => {
            match conn.replay.range(data.from, data.to) {
                Ok(envelopes) => {
                    for envelope in envelopes {
                        if socket
                            .send(Message::Text(
                                envelope.to_json_string().unwrap_or_default().into(),
                            ))
                            .await
                            .is_err()
                        {
                            return false;
                        }
                    }
                }
                Err(miss) => {
                    let payload = ReplayMiss {
                        requested_from: data.from,
                        requested_to: data.to,
                        oldest_available: miss.oldest_available,
                    };
                    enqueue_envelope(conn, message_type::REPLAY_MISS, &payload);
                }
            }
            true
        }
    }
}

/// Pushes a control-plane envelope onto this connection's outgoing queue —
/// the same queue the fan-out engine delivers through — so it is drained in
/// FIFO order relative to any broadcast already queued ahead of it. A full
/// queue means the client is already being treated as slow elsewhere; the
/// control-plane reply is dropped rather than blocking this task.
fn enqueue_envelope<T: serde::Serialize>(conn: &Connection, kind: &str, data: &T) {
    let seq = conn.sequence.next();
    let envelope = Envelope::with_value(seq, now_ms(), kind, data)
        .expect("control-plane payloads are always serializable");
    let text = envelope
        .to_json_string()
        .expect("control-plane payloads are always serializable");
    let _ = conn.try_enqueue(Message::Text(text.into()));
}

/// Writes an error envelope straight to the socket, bypassing the outgoing
/// queue. Only used on the terminal protocol-violation path, where the
/// connection is closing immediately after and there is no later broadcast
/// for this write to race.
async fn send_error_direct(
    conn: &Connection,
    socket: &mut WebSocket,
    code: &'static str,
    message: &str,
    retryable: bool,
) -> Result<(), axum::Error> {
    let payload = ErrorPayload {
        code,
        message: message.to_string(),
        retryable,
    };
    let seq = conn.sequence.next();
    let envelope = Envelope::with_value(seq, now_ms(), message_type::ERROR, &payload)
        .expect("control-plane payloads are always serializable");
    let text = envelope
        .to_json_string()
        .expect("control-plane payloads are always serializable");
    socket.send(Message::Text(text.into())).await
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
