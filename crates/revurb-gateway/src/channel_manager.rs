//! Per-Application channel registry (spec §4.4): creates channels on
//! demand at first subscribe, drops them at last unsubscribe, and is the
//! only thing that ever mutates a [`Channel`]'s membership.

use std::sync::Arc;

use dashmap::DashMap;

use crate::{
    channel::{Channel, SubscribeOutcome},
    connection::Connection,
    error::Result,
};

/// One Application's channel registry. `subscribe`/`unsubscribe` per
/// (channel, connection) pair are serialized by each [`Channel`]'s own
/// lock; this map only serializes channel creation/removal.
pub struct ChannelManager {
    channels: DashMap<String, Arc<Channel>>,
    /// Reverse index: connection id → set of channel names it occupies,
    /// used by `unsubscribe_from_all` and the HTTP `/connections` endpoint.
    memberships: DashMap<String, std::collections::HashSet<String>>,
}

impl Default for ChannelManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelManager {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            memberships: DashMap::new(),
        }
    }

    pub fn find(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels.get(name).map(|c| c.clone())
    }

    pub fn all(&self) -> Vec<Arc<Channel>> {
        self.channels.iter().map(|c| c.clone()).collect()
    }

    /// The union of members across all channels, deduplicated by
    /// connection id (spec §4.4 — used by control-plane endpoints).
    pub fn connections(&self) -> Vec<String> {
        self.memberships.iter().map(|e| e.key().clone()).collect()
    }

    pub fn subscribe(
        &self,
        conn: &Arc<Connection>,
        channel_name: &str,
        app_key: &str,
        app_secret: &str,
        auth: Option<&str>,
        channel_data: Option<&str>,
    ) -> Result<(Arc<Channel>, SubscribeOutcome)> {
        if conn.is_subscribed(channel_name) {
            // Spec §5: a subscribe that observes an existing membership is
            // a no-op reply, not a duplicate.
            let channel = self.find_or_create(channel_name);
            return Ok((channel, SubscribeOutcome { new_presence_member: None }));
        }
        let channel = self.find_or_create(channel_name);
        let outcome = channel.subscribe(conn, app_key, app_secret, auth, channel_data)?;
        self.memberships
            .entry(conn.id.clone())
            .or_default()
            .insert(channel_name.to_string());
        Ok((channel, outcome))
    }

    fn find_or_create(&self, channel_name: &str) -> Arc<Channel> {
        self.channels
            .entry(channel_name.to_string())
            .or_insert_with(|| Arc::new(Channel::new(channel_name)))
            .clone()
    }

    /// Unsubscribes `conn_id` from `channel_name`, dropping the channel
    /// entirely if it becomes empty (spec §4.4 invariant: no channel
    /// exists with zero members). Returns the channel (so the caller can
    /// still fan out `member_removed` to whoever is left in it) together
    /// with the departed presence user id, if any.
    pub fn unsubscribe(&self, conn_id: &str, channel_name: &str) -> Option<(Arc<Channel>, Option<String>)> {
        let channel = self.find(channel_name)?;
        let departed_user = channel.unsubscribe(conn_id);
        if let Some(mut memberships) = self.memberships.get_mut(conn_id) {
            memberships.remove(channel_name);
        }
        if channel.is_empty() {
            self.channels.remove(channel_name);
        }
        Some((channel, departed_user))
    }

    /// Unsubscribes `conn_id` from every channel it occupies. Idempotent;
    /// must complete before the connection's resources are released
    /// (spec §4.4). Returns `(channel, departed_user_id)` pairs for every
    /// presence transition so the caller can fan out `member_removed`.
    pub fn unsubscribe_from_all(&self, conn_id: &str) -> Vec<(Arc<Channel>, String)> {
        let channel_names = self
            .memberships
            .remove(conn_id)
            .map(|(_, set)| set.into_iter().collect::<Vec<_>>())
            .unwrap_or_default();

        let mut departures = Vec::new();
        for channel_name in channel_names {
            let Some(channel) = self.find(&channel_name) else {
                continue;
            };
            if let Some(user_id) = channel.unsubscribe(conn_id) {
                departures.push((channel.clone(), user_id));
            }
            if channel.is_empty() {
                self.channels.remove(&channel_name);
            }
        }
        departures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
            options: serde_json::Value::Null,
        }])
        .unwrap()
        .find_by_key("appkey")
        .unwrap()
    }

    fn test_conn(id: &str) -> Arc<Connection> {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        Arc::new(Connection::new(id.into(), test_app(), "http://x".into(), tx))
    }

    #[test]
    fn channel_created_on_subscribe_and_dropped_on_last_unsubscribe() {
        let manager = ChannelManager::new();
        let conn = test_conn("a");
        manager.subscribe(&conn, "room-1", "appkey", "appsecret", None, None).unwrap();
        assert!(manager.find("room-1").is_some());

        manager.unsubscribe("a", "room-1");
        assert!(manager.find("room-1").is_none());
    }

    #[test]
    fn resubscribe_is_a_no_op() {
        let manager = ChannelManager::new();
        let conn = test_conn("a");
        manager.subscribe(&conn, "room-1", "appkey", "appsecret", None, None).unwrap();
        let (_, outcome) = manager.subscribe(&conn, "room-1", "appkey", "appsecret", None, None).unwrap();
        assert!(outcome.new_presence_member.is_none());
        assert_eq!(manager.find("room-1").unwrap().member_count(), 1);
    }

    #[test]
    fn unsubscribe_from_all_covers_every_channel() {
        let manager = ChannelManager::new();
        let conn = test_conn("a");
        manager.subscribe(&conn, "room-1", "appkey", "appsecret", None, None).unwrap();
        manager.subscribe(&conn, "room-2", "appkey", "appsecret", None, None).unwrap();
        manager.unsubscribe_from_all("a");
        assert!(manager.find("room-1").is_none());
        assert!(manager.find("room-2").is_none());
        assert!(manager.connections().is_empty());
    }
}
