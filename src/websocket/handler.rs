use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        ConnectInfo, Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::chat::{ChatCore, FindOutcome};
use crate::connection_manager::{ConnectionHandle, ConnectionMeta, DisconnectReason};
use crate::error::AppError;
use crate::server::AppState;
use crate::types::ChatType;

use super::message::{ClientMessage, OutboundMessage, ServerMessage};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsQuery {
    pub tab_id: Option<String>,
    pub chat_type: Option<String>,
}

/// WebSocket upgrade handler.
///
/// Admission happens here, before the upgrade, so a refused client gets a
/// plain HTTP error instead of an upgraded socket that closes immediately.
#[tracing::instrument(
    name = "ws.upgrade",
    skip(ws, state, addr, query, headers),
    fields(remote = %addr, tab_hint = ?query.tab_id)
)]
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Response {
    let remote_addr = client_ip(addr, &headers, state.settings.server.trust_forwarded_for);
    let meta = connection_meta(remote_addr, &query, &headers);

    let (tx, rx) = mpsc::channel::<OutboundMessage>(state.settings.websocket.channel_buffer.max(1));
    let handle = match state.core.register_connection(meta, tx) {
        Ok(handle) => handle,
        Err(e) => return AppError::from(e).into_response(),
    };

    tracing::info!(
        connection_id = %handle.id,
        remote_addr = %remote_addr,
        chat_type = %handle.meta.chat_type,
        "WebSocket upgrade accepted"
    );

    let core = state.core.clone();
    let failed_id = handle.id;
    ws.on_failed_upgrade(move |e| {
        tracing::warn!(connection_id = %failed_id, error = %e, "WebSocket upgrade failed");
        core.handle_disconnect(failed_id, DisconnectReason::TransportError);
    })
    .on_upgrade(move |socket| handle_socket(socket, state, handle, rx))
}

/// Client address, optionally taken from the first `X-Forwarded-For` entry
pub fn client_ip(addr: SocketAddr, headers: &HeaderMap, trust_forwarded_for: bool) -> IpAddr {
    if trust_forwarded_for {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return ip;
        }
    }
    addr.ip()
}

fn connection_meta(remote_addr: IpAddr, query: &WsQuery, headers: &HeaderMap) -> ConnectionMeta {
    let mut meta = ConnectionMeta::new(remote_addr);

    if let Some(user_agent) = headers.get(header::USER_AGENT).and_then(|v| v.to_str().ok()) {
        meta = meta.with_user_agent(user_agent);
    }
    if let Some(tab_id) = query.tab_id.as_deref().filter(|t| !t.trim().is_empty()) {
        meta = meta.with_tab_hint(tab_id);
    }
    if let Some(raw) = query.chat_type.as_deref() {
        match raw.parse::<ChatType>() {
            Ok(chat_type) => meta = meta.with_chat_type(chat_type),
            Err(e) => tracing::debug!(error = %e, "Ignoring chatType query parameter"),
        }
    }
    meta
}

/// Handle an established WebSocket connection
#[tracing::instrument(
    name = "ws.connection",
    skip(socket, state, handle, rx),
    fields(connection_id = %handle.id)
)]
async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    handle: Arc<ConnectionHandle>,
    mut rx: mpsc::Receiver<OutboundMessage>,
) {
    let connection_id = handle.id;
    let connection_start = std::time::Instant::now();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Drains the outbound channel. Returns a reason only when the socket failed.
    let writer = handle.clone();
    let mut send_task = tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                msg = rx.recv() => msg,
                _ = writer.close_requested() => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    return None;
                }
            };

            match next {
                Some(OutboundMessage::Batch(messages)) => {
                    let text = match OutboundMessage::batch_json(&messages) {
                        Ok(t) => t,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to serialize batch");
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text.into())).await.is_err() {
                        return Some(DisconnectReason::TransportError);
                    }
                }
                Some(OutboundMessage::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code,
                        reason: reason.into(),
                    };
                    let _ = ws_sender.send(Message::Close(Some(frame))).await;
                    return None;
                }
                None => return None,
            }
        }
    });

    let reader_state = state.clone();
    let reader = handle.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(msg) => {
                    if !process_message(msg, &reader_state.core, &reader).await {
                        return DisconnectReason::ClientClose;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "WebSocket receive error");
                    return DisconnectReason::TransportError;
                }
            }
        }
        DisconnectReason::TransportClose
    });

    let handshake_task = spawn_handshake_watchdog(
        state.core.clone(),
        connection_id,
        Duration::from_secs(state.settings.websocket.handshake_timeout),
    );

    let reason = tokio::select! {
        result = &mut send_task => {
            tracing::debug!(connection_id = %connection_id, "Send task completed");
            result.ok().flatten()
        }
        result = &mut recv_task => {
            tracing::debug!(connection_id = %connection_id, "Receive task completed");
            result.ok()
        }
    };
    send_task.abort();
    recv_task.abort();
    handshake_task.abort();

    // A no-op when the server already closed this connection
    state
        .core
        .handle_disconnect(connection_id, reason.unwrap_or(DisconnectReason::TransportClose));

    tracing::info!(
        connection_id = %connection_id,
        duration_secs = connection_start.elapsed().as_secs_f64(),
        "WebSocket connection closed"
    );
}

/// Close the connection if it has not identified its tab in time
fn spawn_handshake_watchdog(
    core: Arc<ChatCore>,
    connection_id: uuid::Uuid,
    timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        if core.connections().is_live(connection_id) && !core.is_identified(connection_id) {
            tracing::info!(
                connection_id = %connection_id,
                timeout_secs = timeout.as_secs(),
                "Tab not identified in time"
            );
            core.close_connection(connection_id, DisconnectReason::HandshakeTimeout);
        }
    })
}

/// Process a received WebSocket message
/// Returns false if the connection should be closed
async fn process_message(msg: Message, core: &Arc<ChatCore>, handle: &Arc<ConnectionHandle>) -> bool {
    match msg {
        Message::Text(text) => {
            handle.update_activity();

            let client_msg: ClientMessage = match serde_json::from_str(&text) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(connection_id = %handle.id, error = %e, "Failed to parse client message");
                    core.send(handle.id, ServerMessage::error("INVALID_MESSAGE", e.to_string()));
                    return true;
                }
            };

            handle_client_message(client_msg, core, handle).await;
            true
        }
        Message::Binary(_) => {
            core.send(
                handle.id,
                ServerMessage::error("UNSUPPORTED_FORMAT", "Binary messages are not supported"),
            );
            true
        }
        Message::Ping(_) | Message::Pong(_) => {
            handle.update_activity();
            true
        }
        Message::Close(_) => {
            tracing::debug!(connection_id = %handle.id, "Received close frame");
            false
        }
    }
}

/// Dispatch one client event to the core
#[tracing::instrument(
    name = "ws.message",
    skip(msg, core, handle),
    fields(connection_id = %handle.id, message_type = msg.kind())
)]
pub async fn handle_client_message(msg: ClientMessage, core: &Arc<ChatCore>, handle: &Arc<ConnectionHandle>) {
    let connection_id = handle.id;

    let result = match msg {
        ClientMessage::IdentifyTab(request) => {
            core.identify_tab(connection_id, request);
            Ok(())
        }
        ClientMessage::FindPartner { interests } => match core.find_partner(connection_id, &interests) {
            Ok(FindOutcome::Matched(pending)) => {
                core.announce_match(pending).await;
                Ok(())
            }
            Ok(FindOutcome::Queued { .. }) => Ok(()),
            Err(e) => Err(e),
        },
        ClientMessage::CancelSearch => {
            core.cancel_search(connection_id);
            Ok(())
        }
        ClientMessage::LeaveRoom { room_id } => core.leave_room(connection_id, room_id),
        ClientMessage::RoomReady { room_id } => core.acknowledge_room(connection_id, room_id).map(|_| ()),
        ClientMessage::RoomMessage { room_id, payload } => core.relay(connection_id, room_id, payload),
        ClientMessage::HeartbeatResponse { timestamp, .. } => {
            core.record_heartbeat(connection_id, timestamp);
            Ok(())
        }
        ClientMessage::Ping => {
            core.send(connection_id, ServerMessage::Pong);
            Ok(())
        }
    };

    if let Err(e) = result {
        tracing::debug!(connection_id = %connection_id, error = %e, "Client request refused");
        core.send(connection_id, ServerMessage::error(e.code(), e.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use std::net::Ipv4Addr;

    fn peer() -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], 40000))
    }

    #[test]
    fn test_client_ip_ignores_forwarded_for_by_default() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7"));
        assert_eq!(client_ip(peer(), &headers, false), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn test_client_ip_uses_first_forwarded_entry() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        assert_eq!(client_ip(peer(), &headers, true), IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)));
    }

    #[test]
    fn test_client_ip_falls_back_on_garbage() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("not-an-ip"));
        assert_eq!(client_ip(peer(), &headers, true), peer().ip());
    }

    #[test]
    fn test_connection_meta_from_query() {
        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, HeaderValue::from_static("test-agent"));
        let query = WsQuery {
            tab_id: Some("t1".to_string()),
            chat_type: Some("Video".to_string()),
        };

        let meta = connection_meta(peer().ip(), &query, &headers);
        assert_eq!(meta.chat_type, ChatType::Video);
        assert_eq!(meta.tab_hint.as_deref(), Some("t1"));
        assert_eq!(meta.user_agent.as_deref(), Some("test-agent"));
    }

    #[test]
    fn test_connection_meta_unknown_chat_type_defaults() {
        let query = WsQuery {
            tab_id: Some("  ".to_string()),
            chat_type: Some("audio".to_string()),
        };
        let meta = connection_meta(peer().ip(), &query, &HeaderMap::new());
        assert_eq!(meta.chat_type, ChatType::Text);
        assert!(meta.tab_hint.is_none());
    }
}
