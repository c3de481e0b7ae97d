//! The WebSocket server (spec §4.9): the `/app/{app_key}` upgrade handler,
//! the per-connection read loop, and the cleanup that runs on disconnect.
//! Grounded on the teacher's `handle_connection` shape in
//! `examples/zhubby-moltis/crates/gateway/src/server.rs` — split the socket
//! into a write half drained by a dedicated task off an unbounded channel,
//! and a read half driven by the connection's own loop — generalized from
//! their JSON-RPC dispatch to Pusher's `pusher:*` control-event protocol.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{
        ConnectInfo, Path, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use revurb_config::Application;
use revurb_protocol::{ClientFrame, RawFrame, ServerFrame, error_codes};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{connection::Connection, event_handler, state::GatewayState};

pub async fn upgrade(
    State(state): State<Arc<GatewayState>>,
    Path(app_key): Path<String>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let app = match state.registry.find_by_key(&app_key) {
        Ok(app) => app,
        Err(_) => return (StatusCode::NOT_FOUND, "unknown application").into_response(),
    };
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    ws.on_upgrade(move |socket| handle_socket(socket, state, app, origin, addr))
}

async fn handle_socket(socket: WebSocket, state: Arc<GatewayState>, app: Arc<Application>, origin: Option<String>, addr: SocketAddr) {
    let conn_id = Uuid::new_v4().to_string();
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut outbox) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(message) = outbox.recv().await {
            if ws_sink.send(message).await.is_err() {
                break;
            }
        }
    });

    // Step 1 (spec §4.9): quota check, before anything is sent.
    if !state.try_reserve_connection_slot(&app.id, app.max_connections) {
        tracing::info!(conn_id = %conn_id, app_id = %app.id, %addr, "rejected: over connection quota");
        reject(&tx, error_codes::OVER_CAPACITY, "application is over its connection quota");
        drop(tx);
        let _ = writer.await;
        return;
    }

    // Step 2: Origin check, also before `connection_established` is sent.
    if !origin_allowed(&app.allowed_origins, origin.as_deref()) {
        tracing::info!(conn_id = %conn_id, app_id = %app.id, ?origin, "rejected: origin not allowed");
        reject(&tx, error_codes::UNAUTHORIZED, "origin not allowed");
        state.release_connection_slot(&app.id);
        drop(tx);
        let _ = writer.await;
        return;
    }

    let conn = Arc::new(Connection::new(conn_id, app.clone(), origin.unwrap_or_default(), tx.clone()));
    state.register_connection(conn.clone());
    conn.send_frame(&ServerFrame::connection_established(&conn.id, app.activity_timeout));
    tracing::info!(conn_id = %conn.id, app_id = %app.id, %addr, "connection established");

    loop {
        tokio::select! {
            biased;
            () = state.shutdown.cancelled() => break,
            message = ws_stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        if text.len() > app.max_message_size {
                            conn.close(Some(error_codes::MESSAGE_TOO_LARGE), Some("message exceeds max_message_size"));
                            break;
                        }
                        handle_text(&state, &conn, text.as_str()).await;
                    },
                    Some(Ok(Message::Binary(_))) => {
                        conn.send_frame(&ServerFrame::error(error_codes::GENERIC, "binary frames are not supported"));
                    },
                    // tokio-tungstenite auto-replies to an inbound Ping; an
                    // inbound Pong means the peer answered a ping we sent,
                    // so it's a control-frame-capable client from here on.
                    Some(Ok(Message::Pong(_))) => {
                        conn.mark_uses_control_frames();
                        conn.touch();
                    },
                    Some(Ok(Message::Ping(_))) => conn.touch(),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(error)) => {
                        tracing::debug!(conn_id = %conn.id, %error, "websocket read error");
                        break;
                    },
                }
            }
        }
    }

    event_handler::unsubscribe_all_and_notify(&state, &conn);
    conn.close(None, None);
    state.remove_connection(&conn.id);
    drop(tx);
    let _ = writer.await;
    tracing::info!(conn_id = %conn.id, app_id = %app.id, "connection closed");
}

async fn handle_text(state: &Arc<GatewayState>, conn: &Arc<Connection>, text: &str) {
    match serde_json::from_str::<RawFrame>(text) {
        Ok(raw) => event_handler::handle(state, conn, ClientFrame::decode(raw)).await,
        Err(error) => {
            tracing::debug!(conn_id = %conn.id, %error, "malformed frame");
            conn.send_frame(&ServerFrame::error(error_codes::GENERIC, "malformed frame"));
        },
    }
}

/// Sends a `pusher:error` frame followed by a close frame carrying the same
/// code, for connections rejected before a [`Connection`] exists to do it
/// through [`Connection::close`].
fn reject(tx: &mpsc::UnboundedSender<Message>, code: u32, message: &str) {
    if let Ok(json) = serde_json::to_string(&ServerFrame::error(code, message)) {
        let _ = tx.send(Message::Text(json.into()));
    }
    let _ = tx.send(Message::Close(Some(CloseFrame {
        code: code as u16,
        reason: message.to_string().into(),
    })));
}

/// Missing `Origin` header is allowed through — non-browser clients (mobile
/// apps, server-to-server) never send one.
fn origin_allowed(allowed_origins: &[String], origin_header: Option<&str>) -> bool {
    let Some(origin) = origin_header.filter(|o| !o.is_empty()) else {
        return true;
    };
    let Some(host) = origin_host(origin) else { return true };
    allowed_origins.iter().any(|pattern| glob_match(pattern, host))
}

fn origin_host(origin: &str) -> Option<&str> {
    let after_scheme = origin.split("://").nth(1).unwrap_or(origin);
    let host = after_scheme.split(['/', ':']).next()?;
    (!host.is_empty()).then_some(host)
}

/// `*` matches any label sequence (zero or more characters); every other
/// byte must match case-insensitively.
fn glob_match(pattern: &str, text: &str) -> bool {
    let (pattern, text) = (pattern.as_bytes(), text.as_bytes());
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut resume = 0usize;
    while ti < text.len() {
        if pi < pattern.len() && pattern[pi] == b'*' {
            star = Some(pi);
            resume = ti;
            pi += 1;
        } else if pi < pattern.len() && pattern[pi].eq_ignore_ascii_case(&text[ti]) {
            pi += 1;
            ti += 1;
        } else if let Some(star_idx) = star {
            pi = star_idx + 1;
            resume += 1;
            ti = resume;
        } else {
            return false;
        }
    }
    while pattern.get(pi) == Some(&b'*') {
        pi += 1;
    }
    pi == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matches_exact_host() {
        assert!(glob_match("example.com", "example.com"));
        assert!(!glob_match("example.com", "evil.com"));
    }

    #[test]
    fn glob_matches_wildcard_subdomain() {
        assert!(glob_match("*.example.com", "a.b.example.com"));
        assert!(glob_match("*", "anything.at.all"));
        assert!(!glob_match("*.example.com", "example.com"));
    }

    #[test]
    fn origin_host_strips_scheme_and_port() {
        assert_eq!(origin_host("https://example.com:1234"), Some("example.com"));
        assert_eq!(origin_host("http://example.com"), Some("example.com"));
    }

    #[test]
    fn missing_origin_header_is_allowed() {
        assert!(origin_allowed(&["example.com".to_string()], None));
    }

    #[test]
    fn origin_must_match_one_allowed_pattern() {
        let allowed = vec!["*.example.com".to_string()];
        assert!(origin_allowed(&allowed, Some("https://chat.example.com")));
        assert!(!origin_allowed(&allowed, Some("https://evil.com")));
    }
}
