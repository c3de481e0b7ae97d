//! The channel hierarchy (spec §4.3): six variants disambiguated by name
//! prefix, sharing one membership/broadcast contract. A [`Channel`] is
//! created on first subscribe and is never observed with zero members —
//! [`crate::channel_manager::ChannelManager`] owns that invariant.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, RwLock},
};

use revurb_protocol::ServerFrame;
use serde_json::Value;

use crate::{
    connection::Connection,
    error::{Error, Result},
};

/// Disambiguates a channel name by prefix, most-specific first (spec
/// §4.3 — critical: `private-cache-`/`presence-cache-` must be checked
/// before the bare `cache-`/`private-`/`presence-` prefixes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    PrivateEncrypted,
    PrivateCache,
    PresenceCache,
    Cache,
    Private,
    Presence,
    Public,
}

impl ChannelKind {
    pub fn classify(name: &str) -> Self {
        if name.starts_with("private-encrypted-") {
            Self::PrivateEncrypted
        } else if name.starts_with("private-cache-") {
            Self::PrivateCache
        } else if name.starts_with("presence-cache-") {
            Self::PresenceCache
        } else if name.starts_with("cache-") {
            Self::Cache
        } else if name.starts_with("private-") {
            Self::Private
        } else if name.starts_with("presence-") {
            Self::Presence
        } else {
            Self::Public
        }
    }

    pub fn requires_channel_auth(self) -> bool {
        matches!(
            self,
            Self::PrivateEncrypted | Self::PrivateCache | Self::Private | Self::PresenceCache | Self::Presence
        )
    }

    pub fn is_presence(self) -> bool {
        matches!(self, Self::Presence | Self::PresenceCache)
    }

    pub fn is_cache(self) -> bool {
        matches!(self, Self::Cache | Self::PrivateCache | Self::PresenceCache)
    }

    /// Whether `client-*` events may target this channel (spec §4.6:
    /// private and presence variants only, public channels reject).
    pub fn accepts_client_events(self) -> bool {
        matches!(
            self,
            Self::Private | Self::PrivateCache | Self::Presence | Self::PresenceCache
        )
    }
}

struct PresenceMember {
    user_info: Option<Value>,
    conn_ids: std::collections::HashSet<String>,
}

struct CachedPayload {
    event: String,
    data: Value,
}

struct State {
    members: HashMap<String, Arc<Connection>>,
    presence: BTreeMap<String, PresenceMember>,
    cache: Option<CachedPayload>,
}

/// One channel within one Application's [`crate::channel_manager::ChannelManager`].
pub struct Channel {
    pub name: String,
    pub kind: ChannelKind,
    state: RwLock<State>,
}

/// What a successful subscribe reports back to the caller, so the event
/// handler (§4.5) knows whether a `member_added` fan-out is also needed.
pub struct SubscribeOutcome {
    pub new_presence_member: Option<(String, Option<Value>)>,
}

impl Channel {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let kind = ChannelKind::classify(&name);
        Self {
            name,
            kind,
            state: RwLock::new(State {
                members: HashMap::new(),
                presence: BTreeMap::new(),
                cache: None,
            }),
        }
    }

    fn state(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn state_mut(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn member_count(&self) -> usize {
        self.state().members.len()
    }

    pub fn user_count(&self) -> usize {
        self.state().presence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.member_count() == 0
    }

    pub fn has_member(&self, conn_id: &str) -> bool {
        self.state().members.contains_key(conn_id)
    }

    pub fn presence_user_ids(&self) -> Vec<String> {
        self.state().presence.keys().cloned().collect()
    }

    pub fn has_cached_payload(&self) -> bool {
        self.state().cache.is_some()
    }

    pub fn cached_payload(&self) -> Option<(String, Value)> {
        self.state().cache.as_ref().map(|c| (c.event.clone(), c.data.clone()))
    }

    /// Verifies channel auth (private/presence variants) and validates
    /// presence `channel_data`, but does not yet mutate membership —
    /// split out so the caller can build the right error payload without
    /// holding the membership lock across it.
    fn authorize(
        &self,
        app_key: &str,
        app_secret: &str,
        conn_id: &str,
        auth: Option<&str>,
        channel_data: Option<&str>,
    ) -> Result<Option<revurb_protocol::PresenceChannelData>> {
        if self.kind == ChannelKind::PrivateEncrypted {
            return Err(Error::Subscription(
                "private-encrypted channels are not supported".to_string(),
            ));
        }
        if self.kind.requires_channel_auth() {
            let auth = auth.ok_or_else(|| Error::Unauthorized("missing auth".to_string()))?;
            if !revurb_common::signature::verify_channel_auth(
                app_key,
                app_secret,
                conn_id,
                &self.name,
                channel_data,
                auth,
            ) {
                return Err(Error::Unauthorized("invalid channel signature".to_string()));
            }
        }
        if self.kind.is_presence() {
            let raw = channel_data.ok_or_else(|| {
                Error::Subscription("presence channel subscribe requires channel_data".to_string())
            })?;
            let data: revurb_protocol::PresenceChannelData = serde_json::from_str(raw)
                .map_err(|_| Error::Subscription("channel_data missing user_id".to_string()))?;
            return Ok(Some(data));
        }
        Ok(None)
    }

    /// Subscribes `conn` to this channel (spec §4.3). On success, sends
    /// `subscription_succeeded` (and, for cache variants, a cache-miss or
    /// replay) to `conn` directly; the caller is responsible for the
    /// presence `member_added` fan-out to *other* members described by
    /// the returned [`SubscribeOutcome`].
    pub fn subscribe(
        &self,
        conn: &Arc<Connection>,
        app_key: &str,
        app_secret: &str,
        auth: Option<&str>,
        channel_data: Option<&str>,
    ) -> Result<SubscribeOutcome> {
        let presence_data = self.authorize(app_key, app_secret, &conn.id, auth, channel_data)?;

        let mut new_presence_member = None;
        {
            let mut state = self.state_mut();
            state.members.insert(conn.id.clone(), conn.clone());

            if let Some(data) = &presence_data {
                let entry = state.presence.entry(data.user_id.clone()).or_insert_with(|| PresenceMember {
                    user_info: data.user_info.clone(),
                    conn_ids: std::collections::HashSet::new(),
                });
                let is_new_user = entry.conn_ids.is_empty();
                entry.conn_ids.insert(conn.id.clone());
                if is_new_user {
                    new_presence_member = Some((data.user_id.clone(), data.user_info.clone()));
                }
            }
        }
        conn.add_subscription(&self.name);

        let succeeded_data = if self.kind.is_presence() {
            let state = self.state();
            let hash: serde_json::Map<String, Value> = state
                .presence
                .iter()
                .map(|(uid, m)| (uid.clone(), m.user_info.clone().unwrap_or(Value::Null)))
                .collect();
            serde_json::json!({
                "presence": {
                    "count": state.presence.len(),
                    "ids": state.presence.keys().cloned().collect::<Vec<_>>(),
                    "hash": hash,
                }
            })
        } else {
            Value::Object(Default::default())
        };
        conn.send_frame(&ServerFrame::subscription_succeeded(&self.name, succeeded_data));

        if self.kind.is_cache() {
            match self.cached_payload() {
                Some((event, data)) => conn.send_frame(&ServerFrame::event(&self.name, &event, data)),
                None => conn.send_frame(&ServerFrame::cache_miss(&self.name)),
            }
        }

        Ok(SubscribeOutcome { new_presence_member })
    }

    /// Removes `conn_id` from this channel. Idempotent. Returns the user
    /// id whose *last* connection just left, if this unsubscribe caused a
    /// presence 1→0 transition — the caller fans out `member_removed`.
    pub fn unsubscribe(&self, conn_id: &str) -> Option<String> {
        let mut state = self.state_mut();
        if state.members.remove(conn_id).is_none() {
            return None;
        }
        let mut departed_user = None;
        state.presence.retain(|user_id, member| {
            if !member.conn_ids.remove(conn_id) {
                return true;
            }
            if member.conn_ids.is_empty() {
                departed_user = Some(user_id.clone());
                false
            } else {
                true
            }
        });
        departed_user
    }

    fn members_snapshot(&self, except: Option<&str>) -> Vec<Arc<Connection>> {
        self.state()
            .members
            .iter()
            .filter(|(id, _)| except != Some(id.as_str()))
            .map(|(_, c)| c.clone())
            .collect()
    }

    /// Sends `event`/`data` to every member but `except` (spec §4.3).
    /// Externally-originated: updates the cache for cache-variant channels
    /// first, so a subscribe racing this broadcast sees the new payload.
    pub fn broadcast(&self, event: &str, data: &Value, except: Option<&str>) {
        if self.kind.is_cache() {
            self.state_mut().cache = Some(CachedPayload {
                event: event.to_string(),
                data: data.clone(),
            });
        }
        self.broadcast_internally(event, data, except);
    }

    /// Like [`Self::broadcast`] but never touches the cache — used for
    /// client-originated `client-*` chatter, which must not redefine a
    /// cache channel's "current state" (spec §4.3).
    pub fn broadcast_internally(&self, event: &str, data: &Value, except: Option<&str>) {
        let frame = ServerFrame::event(&self.name, event, data.clone());
        for member in self.members_snapshot(except) {
            member.send_frame(&frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_most_specific_prefix_first() {
        assert_eq!(ChannelKind::classify("private-cache-prices"), ChannelKind::PrivateCache);
        assert_eq!(ChannelKind::classify("presence-cache-prices"), ChannelKind::PresenceCache);
        assert_eq!(ChannelKind::classify("cache-prices"), ChannelKind::Cache);
        assert_eq!(ChannelKind::classify("private-room"), ChannelKind::Private);
        assert_eq!(ChannelKind::classify("presence-room"), ChannelKind::Presence);
        assert_eq!(ChannelKind::classify("room"), ChannelKind::Public);
        assert_eq!(
            ChannelKind::classify("private-encrypted-room"),
            ChannelKind::PrivateEncrypted
        );
    }

    #[test]
    fn client_events_rejected_on_public_channels() {
        assert!(!ChannelKind::Public.accepts_client_events());
        assert!(ChannelKind::Private.accepts_client_events());
        assert!(ChannelKind::PresenceCache.accepts_client_events());
    }

    fn test_app() -> Arc<revurb_config::Application> {
        revurb_config::AppRegistry::build(vec![revurb_config::ApplicationConfig {
            id: "1".into(),
            key: "appkey".into(),
            secret: "appsecret".into(),
            ping_interval: 120,
            activity_timeout: 30,
            allowed_origins: vec!["*".into()],
            max_message_size: 10_000,
            max_connections: None,
            options: Value::Null,
        }])
        .unwrap()
        .find_by_key("appkey")
        .unwrap()
    }

    fn test_conn(id: &str) -> (Arc<Connection>, tokio::sync::mpsc::UnboundedReceiver<axum::extract::ws::Message>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Arc::new(Connection::new(id.into(), test_app(), "http://x".into(), tx)), rx)
    }

    #[test]
    fn public_channel_subscribe_and_broadcast() {
        let channel = Channel::new("room-1");
        let (a, mut a_rx) = test_conn("a");
        let (b, mut b_rx) = test_conn("b");
        channel.subscribe(&a, "appkey", "appsecret", None, None).unwrap();
        channel.subscribe(&b, "appkey", "appsecret", None, None).unwrap();
        let _ = a_rx.try_recv();
        let _ = b_rx.try_recv();

        channel.broadcast("greet", &serde_json::json!({"hi": 1}), Some("a"));
        assert!(a_rx.try_recv().is_err());
        assert!(b_rx.try_recv().is_ok());
    }

    #[test]
    fn private_channel_rejects_bad_auth() {
        let channel = Channel::new("private-room");
        let (a, _rx) = test_conn("a");
        let err = channel
            .subscribe(&a, "appkey", "appsecret", Some("appkey:garbage"), None)
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
    }

    #[test]
    fn private_channel_accepts_valid_auth() {
        let channel = Channel::new("private-room");
        let (a, _rx) = test_conn("a");
        let to_sign = revurb_common::signature::channel_auth_string("a", "private-room", None);
        let sig = revurb_common::signature::sign_hex("appsecret", &to_sign).unwrap();
        let auth = format!("appkey:{sig}");
        assert!(channel.subscribe(&a, "appkey", "appsecret", Some(&auth), None).is_ok());
    }

    #[test]
    fn presence_member_added_fires_once_per_user() {
        let channel = Channel::new("presence-chat");
        let (a, _a_rx) = test_conn("a");
        let (b1, _b1_rx) = test_conn("b1");
        let (b2, _b2_rx) = test_conn("b2");

        let subscribe = |conn: &Arc<Connection>, user_id: &str| {
            let data = format!(r#"{{"user_id":"{user_id}"}}"#);
            let to_sign = revurb_common::signature::channel_auth_string("x", "presence-chat", Some(&data));
            // socket id used for signing must match the connection's id.
            let to_sign = to_sign.replacen("x:", &format!("{}:", conn.id), 1);
            let sig = revurb_common::signature::sign_hex("appsecret", &to_sign).unwrap();
            let auth = format!("appkey:{sig}");
            channel.subscribe(conn, "appkey", "appsecret", Some(&auth), Some(&data))
        };

        let outcome = subscribe(&a, "u1").unwrap();
        assert!(outcome.new_presence_member.is_none());

        let outcome = subscribe(&b1, "u2").unwrap();
        assert_eq!(outcome.new_presence_member.unwrap().0, "u2");

        // A second connection for the same user must not re-fire member_added.
        let outcome = subscribe(&b2, "u2").unwrap();
        assert!(outcome.new_presence_member.is_none());

        assert_eq!(channel.user_count(), 2);
        assert_eq!(channel.member_count(), 3);

        assert!(channel.unsubscribe("b2").is_none());
        assert_eq!(channel.unsubscribe("b1").as_deref(), Some("u2"));
        assert_eq!(channel.user_count(), 1);
    }

    #[test]
    fn cache_channel_miss_then_replay() {
        let channel = Channel::new("cache-prices");
        let (a, mut a_rx) = test_conn("a");
        channel.subscribe(&a, "appkey", "appsecret", None, None).unwrap();
        let _ = a_rx.try_recv(); // subscription_succeeded
        let miss: revurb_protocol::RawFrame =
            serde_json::from_str(&a_rx.try_recv().map(|m| frame_text(m)).unwrap()).unwrap();
        assert_eq!(miss.event, "pusher:cache_miss");

        channel.broadcast("tick", &serde_json::json!({"p": 42}), None);
        let _ = a_rx.try_recv(); // the broadcast itself hits the existing member too

        let (b, mut b_rx) = test_conn("b");
        channel.subscribe(&b, "appkey", "appsecret", None, None).unwrap();
        let _ = b_rx.try_recv(); // subscription_succeeded
        let replay: revurb_protocol::RawFrame =
            serde_json::from_str(&b_rx.try_recv().map(|m| frame_text(m)).unwrap()).unwrap();
        assert_eq!(replay.event, "tick");
        assert_eq!(replay.data.unwrap()["p"], 42);
    }

    fn frame_text(message: axum::extract::ws::Message) -> String {
        match message {
            axum::extract::ws::Message::Text(t) => t.to_string(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }
}
