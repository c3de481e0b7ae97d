//! Routes `pusher:*` control events (spec §4.5): ping/pong, subscribe,
//! unsubscribe, signin. `client-*` events are handled separately in
//! [`crate::client_event`].

use std::sync::Arc;

use revurb_common::signature;
use revurb_protocol::{ClientFrame, ServerFrame, error_codes};

use crate::{connection::Connection, error::Error, state::GatewayState};

pub async fn handle(state: &Arc<GatewayState>, conn: &Arc<Connection>, frame: ClientFrame) {
    match frame {
        ClientFrame::Ping => {
            conn.touch();
            conn.send_frame(&ServerFrame::pong());
        },
        ClientFrame::Pong => {
            conn.touch();
        },
        ClientFrame::Subscribe(data) => {
            conn.touch();
            handle_subscribe(state, conn, data).await;
        },
        ClientFrame::Unsubscribe(data) => {
            conn.touch();
            handle_unsubscribe(state, conn, &data.channel);
        },
        ClientFrame::Signin(data) => {
            conn.touch();
            handle_signin(conn, data);
        },
        ClientFrame::Client { event, channel, data } => {
            conn.touch();
            crate::client_event::handle(state, conn, &event, &channel, data).await;
        },
        ClientFrame::Unknown { event } => {
            conn.touch();
            tracing::info!(conn_id = %conn.id, %event, "unknown control event");
            conn.send_frame(&ServerFrame::error(error_codes::UNAUTHORIZED, "unknown control event"));
        },
    }
}

async fn handle_subscribe(state: &Arc<GatewayState>, conn: &Arc<Connection>, data: revurb_protocol::frames::SubscribeData) {
    let manager = state.channel_manager(&conn.app.id);
    match manager.subscribe(
        conn,
        &data.channel,
        &conn.app.key,
        conn.app.secret(),
        data.auth.as_deref(),
        data.channel_data.as_deref(),
    ) {
        Ok((channel, outcome)) => {
            if let Some((user_id, user_info)) = outcome.new_presence_member {
                let frame = ServerFrame::member_added(&data.channel, &user_id, user_info);
                broadcast_to_others(&channel, &conn.id, &frame);
            }
        },
        Err(error) => {
            tracing::info!(conn_id = %conn.id, channel = %data.channel, %error, "subscribe rejected");
            let (kind, status) = classify(&error);
            conn.send_frame(&ServerFrame::subscription_error(&data.channel, kind, &error.to_string(), status));
        },
    }
}

fn handle_unsubscribe(state: &Arc<GatewayState>, conn: &Arc<Connection>, channel_name: &str) {
    let manager = state.channel_manager(&conn.app.id);
    conn.remove_subscription(channel_name);
    if let Some((channel, Some(user_id))) = manager.unsubscribe(&conn.id, channel_name) {
        let frame = ServerFrame::member_removed(channel_name, &user_id);
        broadcast_to_others(&channel, &conn.id, &frame);
    }
}

/// Unsubscribes `conn` from every channel it occupies and fans out
/// `member_removed` for each presence departure. Shared by the WebSocket
/// read loop on disconnect and the lifecycle stale-connection sweep (spec
/// §4.4, §4.9, §4.11).
pub fn unsubscribe_all_and_notify(state: &Arc<GatewayState>, conn: &Arc<Connection>) {
    let manager = state.channel_manager(&conn.app.id);
    for (channel, user_id) in manager.unsubscribe_from_all(&conn.id) {
        let frame = ServerFrame::member_removed(&channel.name, &user_id);
        broadcast_to_others(&channel, &conn.id, &frame);
    }
}

/// Closes and unsubscribes every local connection of `app_id` signed in as
/// `user_id` (spec §4.8, §4.10) — driven either by the HTTP control API
/// directly, or by a `Terminate` message arriving off the pub/sub bus for
/// a user connected to a different node in the fleet.
pub fn terminate_user(state: &Arc<GatewayState>, app_id: &str, user_id: &str) {
    for conn in state.connections_for_app(app_id) {
        if conn.user_id().as_deref() == Some(user_id) {
            unsubscribe_all_and_notify(state, &conn);
            conn.close(Some(error_codes::GENERIC), Some("connection terminated by control API"));
        }
    }
}

fn handle_signin(conn: &Arc<Connection>, data: revurb_protocol::frames::SigninData) {
    if signature::verify_signin_auth(conn.app.secret(), &conn.id, &data.user_data, &data.auth) {
        conn.set_user_data(data.user_data.clone());
        conn.send_frame(&ServerFrame::signin_success(&data.user_data));
    } else {
        tracing::info!(conn_id = %conn.id, "signin rejected");
        conn.send_frame(&ServerFrame::error(error_codes::UNAUTHORIZED, "invalid signin signature"));
    }
}

fn classify(error: &Error) -> (&'static str, u32) {
    match error {
        Error::Unauthorized(_) => ("AuthError", 401),
        Error::Subscription(_) => ("SubscriptionError", 400),
        _ => ("ServerError", 500),
    }
}

/// Unsubscribe/downgrade to "every other member" fan-outs sent directly
/// through a channel, bypassing [`crate::dispatcher::EventDispatcher`] —
/// these are protocol-internal notifications, not `client-*`/trigger
/// events, and have no cache/bus semantics to worry about.
fn broadcast_to_others(channel: &crate::channel::Channel, except: &str, frame: &revurb_protocol::RawFrame) {
    let Some(data) = &frame.data else { return };
    channel.broadcast_internally(&frame.event, data, Some(except));
}
