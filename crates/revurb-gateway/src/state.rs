//! Process-wide shared state (spec §5): the Application Registry, one
//! [`ChannelManager`] per Application, the global connection registry,
//! and the handles the lifecycle jobs and control plane both need.

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use dashmap::DashMap;
use revurb_config::AppRegistry;
use tokio_util::sync::CancellationToken;

use crate::{channel_manager::ChannelManager, connection::Connection, dispatcher::EventDispatcher, metrics::MetricsAggregator};

/// Everything the WebSocket server, HTTP control API, and lifecycle jobs
/// share. Built once at startup and handed around as `Arc<GatewayState>`.
pub struct GatewayState {
    pub registry: AppRegistry,
    pub dispatcher: EventDispatcher,
    pub metrics: MetricsAggregator,
    pub shutdown: CancellationToken,
    channel_managers: DashMap<String, Arc<ChannelManager>>,
    connections: DashMap<String, Arc<Connection>>,
    connection_counts: DashMap<String, AtomicU32>,
}

impl GatewayState {
    pub fn new(registry: AppRegistry, dispatcher: EventDispatcher) -> Arc<Self> {
        Arc::new(Self {
            registry,
            dispatcher,
            metrics: MetricsAggregator::new(),
            shutdown: CancellationToken::new(),
            channel_managers: DashMap::new(),
            connections: DashMap::new(),
            connection_counts: DashMap::new(),
        })
    }

    /// The per-Application channel registry, created lazily on first use.
    pub fn channel_manager(&self, app_id: &str) -> Arc<ChannelManager> {
        self.channel_managers
            .entry(app_id.to_string())
            .or_insert_with(|| Arc::new(ChannelManager::new()))
            .clone()
    }

    pub fn all_connections(&self) -> Vec<Arc<Connection>> {
        self.connections.iter().map(|c| c.clone()).collect()
    }

    pub fn connections_for_app(&self, app_id: &str) -> Vec<Arc<Connection>> {
        self.connections.iter().filter(|c| c.app.id == app_id).map(|c| c.clone()).collect()
    }

    pub fn connection_count(&self, app_id: &str) -> u32 {
        self.connection_counts
            .get(app_id)
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Attempts to reserve a connection slot for `app_id`. Returns `false`
    /// (and reserves nothing) if `max_connections` would be exceeded —
    /// the caller closes with protocol error 4004 (spec §4.9 step 1).
    pub fn try_reserve_connection_slot(&self, app_id: &str, max_connections: Option<u32>) -> bool {
        let counter = self.connection_counts.entry(app_id.to_string()).or_insert_with(|| AtomicU32::new(0));
        loop {
            let current = counter.load(Ordering::Acquire);
            if let Some(max) = max_connections
                && current >= max
            {
                return false;
            }
            if counter
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub fn register_connection(&self, conn: Arc<Connection>) {
        self.connections.insert(conn.id.clone(), conn);
    }

    /// Releases a slot reserved by [`Self::try_reserve_connection_slot`]
    /// for a connection that is being rejected before it ever reaches
    /// [`Self::register_connection`] (e.g. failed origin check).
    pub fn release_connection_slot(&self, app_id: &str) {
        if let Some(counter) = self.connection_counts.get(app_id) {
            counter.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Removes the connection from the global registry and releases its
    /// reserved slot. Does NOT unsubscribe it from channels — callers must
    /// do that first via `channel_manager(..).unsubscribe_from_all` (spec
    /// §4.4: must complete before the Connection's resources are released).
    pub fn remove_connection(&self, conn_id: &str) -> Option<Arc<Connection>> {
        let (_, conn) = self.connections.remove(conn_id)?;
        if let Some(counter) = self.connection_counts.get(&conn.app.id) {
            counter.fetch_sub(1, Ordering::AcqRel);
        }
        Some(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> AppRegistry {
        AppRegistry::build(vec![revurb_config::ApplicationConfig {
            id: "1".into(),
            key: "appkey".into(),
            secret: "appsecret".into(),
            ping_interval: 120,
            activity_timeout: 30,
            allowed_origins: vec!["*".into()],
            max_message_size: 10_000,
            max_connections: Some(1),
            options: serde_json::Value::Null,
        }])
        .unwrap()
    }

    #[test]
    fn reserves_up_to_max_connections() {
        let state = GatewayState::new(registry(), EventDispatcher::new(None, "revurb"));
        assert!(state.try_reserve_connection_slot("1", Some(1)));
        assert!(!state.try_reserve_connection_slot("1", Some(1)));
    }

    #[test]
    fn releasing_a_connection_frees_its_slot() {
        let state = GatewayState::new(registry(), EventDispatcher::new(None, "revurb"));
        assert!(state.try_reserve_connection_slot("1", Some(1)));
        let app = state.registry.find_by_id("1").unwrap();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let conn = Arc::new(Connection::new("c1".into(), app, "http://x".into(), tx));
        state.register_connection(conn);
        state.remove_connection("c1");
        assert!(state.try_reserve_connection_slot("1", Some(1)));
    }
}
