//! Validates and fans out `client-*` events (spec §4.6). A rejected event
//! is always dropped after a protocol error goes back to the sender — it
//! never closes the connection.

use std::sync::Arc;

use revurb_protocol::error_codes;
use serde_json::Value;

use crate::{
    channel::ChannelKind,
    connection::Connection,
    dispatcher::Origin,
    state::GatewayState,
};

/// Pusher's allowed event-name character set: alphanumerics plus a small
/// set of punctuation used by conventional event names like `client-my_event`.
fn is_valid_event_name(event: &str) -> bool {
    event
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'=' | b'@' | b',' | b'.' | b';'))
}

pub async fn handle(state: &Arc<GatewayState>, conn: &Arc<Connection>, event: &str, channel_name: &str, data: Value) {
    if !is_valid_event_name(event) {
        reject(conn, error_codes::GENERIC, "client event name contains disallowed characters");
        return;
    }

    let kind = ChannelKind::classify(channel_name);
    if !kind.accepts_client_events() {
        reject(conn, error_codes::GENERIC, "client events are only allowed on private/presence channels");
        return;
    }

    if !conn.is_subscribed(channel_name) {
        reject(conn, error_codes::GENERIC, "not subscribed to target channel");
        return;
    }

    let serialized = match serde_json::to_vec(&data) {
        Ok(bytes) => bytes,
        Err(_) => {
            reject(conn, error_codes::GENERIC, "client event payload is not valid JSON");
            return;
        },
    };
    if serialized.len() > conn.app.max_message_size {
        reject(conn, error_codes::MESSAGE_TOO_LARGE, "client event payload exceeds max_message_size");
        return;
    }

    let manager = state.channel_manager(&conn.app.id);
    state
        .dispatcher
        .dispatch(&manager, &conn.app.id, channel_name, event, &data, Some(&conn.id), Origin::ClientEvent, false)
        .await;
}

fn reject(conn: &Arc<Connection>, code: u32, message: &str) {
    tracing::debug!(conn_id = %conn.id, code, message, "client event rejected");
    conn.send_frame(&revurb_protocol::ServerFrame::error(code, message));
}
