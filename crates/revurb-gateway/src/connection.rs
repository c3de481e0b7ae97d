//! Per-socket state (spec §3, §4.2): identity, activity tracking, and the
//! send/close primitives the rest of the engine drives a connection
//! through. `ws.rs` owns the actual socket; everything else only ever
//! sees an `Arc<Connection>`.

use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use axum::extract::ws::{CloseFrame, Message};
use revurb_config::Application;
use revurb_protocol::ServerFrame;
use tokio::sync::mpsc::UnboundedSender;

/// The three-way classification of spec §3. Derived from `last_seen_at`
/// and `has_been_pinged`, never stored directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Active,
    Inactive,
    Stale,
}

struct Inner {
    last_seen_at: Instant,
    has_been_pinged: bool,
    uses_control_frames: bool,
    user_data: Option<String>,
    subscribed_channels: HashSet<String>,
}

/// One accepted WebSocket, bound to exactly one [`Application`] for its
/// lifetime (spec §3 invariant). Cheap to clone via `Arc`; channels and
/// the connection registry only ever hold the `Arc`, never the socket.
pub struct Connection {
    pub id: String,
    pub app: Arc<Application>,
    pub origin: String,
    closed: AtomicBool,
    sender: UnboundedSender<Message>,
    inner: Mutex<Inner>,
}

impl Connection {
    pub fn new(id: String, app: Arc<Application>, origin: String, sender: UnboundedSender<Message>) -> Self {
        Self {
            id,
            app,
            origin,
            closed: AtomicBool::new(false),
            sender,
            inner: Mutex::new(Inner {
                last_seen_at: Instant::now(),
                has_been_pinged: false,
                uses_control_frames: false,
                user_data: None,
                subscribed_channels: HashSet::new(),
            }),
        }
    }

    /// Records inbound activity and clears `has_been_pinged` (spec §3: any
    /// inbound frame — text, or a control-frame pong — touches).
    pub fn touch(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.last_seen_at = Instant::now();
        inner.has_been_pinged = false;
    }

    /// Records that a ping (protocol-level or RFC 6455 control frame) has
    /// been issued since the last inbound activity.
    pub fn mark_pinged(&self) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).has_been_pinged = true;
    }

    pub fn mark_uses_control_frames(&self) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).uses_control_frames = true;
    }

    pub fn uses_control_frames(&self) -> bool {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).uses_control_frames
    }

    pub fn set_user_data(&self, user_data: String) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).user_data = Some(user_data);
    }

    pub fn user_id(&self) -> Option<String> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let raw = inner.user_data.as_ref()?;
        let value: serde_json::Value = serde_json::from_str(raw).ok()?;
        value.get("user_id").map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    pub fn add_subscription(&self, channel: &str) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .subscribed_channels
            .insert(channel.to_string());
    }

    pub fn remove_subscription(&self, channel: &str) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .subscribed_channels
            .remove(channel);
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .subscribed_channels
            .contains(channel)
    }

    pub fn subscribed_channels(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .subscribed_channels
            .iter()
            .cloned()
            .collect()
    }

    /// Classifies state per spec §3: ACTIVE while within `ping_interval` of
    /// last activity, INACTIVE once past it but not yet pinged, STALE once
    /// pinged and still silent.
    pub fn state(&self) -> ConnectionState {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let elapsed = inner.last_seen_at.elapsed();
        let threshold = Duration::from_secs(self.app.ping_interval);
        if elapsed < threshold {
            ConnectionState::Active
        } else if inner.has_been_pinged {
            ConnectionState::Stale
        } else {
            ConnectionState::Inactive
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Best-effort send; a no-op on an already-closed connection (spec
    /// §4.2). Serialization failures are the caller's bug, not a runtime
    /// condition, so they're logged rather than propagated.
    pub fn send_frame(&self, frame: &revurb_protocol::RawFrame) {
        if self.is_closed() {
            return;
        }
        match serde_json::to_string(frame) {
            Ok(json) => {
                if self.sender.send(Message::Text(json.into())).is_err() {
                    self.closed.store(true, Ordering::Release);
                }
            },
            Err(error) => tracing::warn!(conn_id = %self.id, %error, "failed to serialize frame"),
        }
    }

    /// Issues a ping appropriate to what the peer has shown it understands
    /// (spec §4.9.5): an RFC 6455 control-frame ping once the peer has
    /// proven it answers those, otherwise the protocol-level `pusher:ping`.
    pub fn send_ping(&self) {
        if self.is_closed() {
            return;
        }
        if self.uses_control_frames() {
            let _ = self.sender.send(Message::Ping(Vec::new().into()));
        } else {
            self.send_frame(&ServerFrame::ping());
        }
    }

    /// Initiates clean shutdown, optionally preceded by a `pusher:error`
    /// frame carrying `code`/`reason` (spec §4.2, §6 error codes).
    /// Idempotent: closing twice is a no-op.
    pub fn close(&self, code: Option<u32>, reason: Option<&str>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(code) = code {
            let frame = ServerFrame::error(code, reason.unwrap_or("connection closed"));
            if let Ok(json) = serde_json::to_string(&frame) {
                let _ = self.sender.send(Message::Text(json.into()));
            }
        }
        let _ = self.sender.send(Message::Close(Some(CloseFrame {
            code: 1000,
            reason: reason.unwrap_or("").to_string().into(),
        })));
    }
}
