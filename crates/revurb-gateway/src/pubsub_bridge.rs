//! The Pub/Sub Bridge (spec §4.8): the one task, per node, that turns
//! fleet-wide bus traffic back into local effects — event dispatch,
//! metrics-request replies, and user termination. Only runs at all when
//! `scaling.enabled` gave [`crate::dispatcher::EventDispatcher`] a bus.

use std::sync::Arc;

use revurb_pubsub::{Bus, PubSubMessage};
use serde_json::{Value, json};

use crate::{dispatcher::Origin, event_handler, metrics, state::GatewayState};

pub async fn run(state: Arc<GatewayState>) {
    let Some(bus) = state.dispatcher.bus().cloned() else {
        return;
    };
    let channel = state.dispatcher.bus_channel().to_string();
    let mut inbox = match bus.subscribe(&channel).await {
        Ok(inbox) => inbox,
        Err(error) => {
            tracing::error!(%error, "pub/sub bridge failed to subscribe, fleet-wide fan-out is disabled");
            return;
        },
    };

    loop {
        tokio::select! {
            biased;
            () = state.shutdown.cancelled() => break,
            message = inbox.recv() => {
                match message {
                    Some(message) => handle_message(&state, &bus, &channel, message).await,
                    None => break,
                }
            }
        }
    }
}

async fn handle_message(state: &Arc<GatewayState>, bus: &Arc<dyn Bus>, bus_channel: &str, message: PubSubMessage) {
    match message {
        PubSubMessage::Message {
            application_id,
            channel,
            event_payload,
            except_socket_id,
            from_client,
        } => {
            let Some(event) = event_payload.get("event").and_then(Value::as_str) else {
                return;
            };
            let data = event_payload.get("data").cloned().unwrap_or(Value::Null);
            let manager = state.channel_manager(&application_id);
            let origin = if from_client { Origin::ClientEvent } else { Origin::External };
            state
                .dispatcher
                .dispatch(&manager, &application_id, &channel, event, &data, except_socket_id.as_deref(), origin, true)
                .await;
        },
        PubSubMessage::Metrics {
            application_id,
            request_key,
            metric_type,
            options,
        } => {
            let payload = local_metric(state, &application_id, &metric_type, &options);
            let reply = PubSubMessage::MetricsRetrieved { request_key, payload };
            if let Err(error) = bus.publish(bus_channel, reply).await {
                tracing::warn!(%error, "failed to publish metrics-retrieved reply");
            }
        },
        PubSubMessage::MetricsRetrieved { request_key, payload } => {
            state.metrics.deliver_reply(&request_key, payload);
        },
        PubSubMessage::Terminate { application_id, user_id } => {
            event_handler::terminate_user(state, &application_id, &user_id);
        },
    }
}

/// This node's contribution to a fleet-wide metrics request (spec §4.12);
/// the requesting node merges every reply, including its own local one.
fn local_metric(state: &Arc<GatewayState>, application_id: &str, metric_type: &str, options: &Value) -> Value {
    let manager = state.channel_manager(application_id);
    match metric_type {
        "channels" => {
            let filter = options.get("filter_by_prefix").and_then(Value::as_str);
            let fields = metrics::parse_info_fields(options.get("info").and_then(Value::as_str));
            metrics::local_channels(&manager, filter, &fields)
        },
        "channel" => {
            let Some(channel_name) = options.get("channel").and_then(Value::as_str) else {
                return json!({ "occupied": false });
            };
            let fields = metrics::parse_info_fields(options.get("info").and_then(Value::as_str));
            match manager.find(channel_name) {
                Some(channel) => {
                    let mut summary = metrics::channel_summary(&channel, &fields);
                    summary["occupied"] = Value::Bool(true);
                    summary
                },
                None => json!({ "occupied": false }),
            }
        },
        "channel_users" => {
            let Some(channel_name) = options.get("channel").and_then(Value::as_str) else {
                return json!({ "users": [] });
            };
            let users = manager
                .find(channel_name)
                .filter(|channel| channel.kind.is_presence())
                .map(|channel| channel.presence_user_ids())
                .unwrap_or_default();
            json!({ "users": users.into_iter().map(|id| json!({ "id": id })).collect::<Vec<_>>() })
        },
        "connections" => json!({ "count": state.connection_count(application_id) }),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use revurb_config::AppRegistry;

    use super::*;
    use crate::{connection::Connection, dispatcher::EventDispatcher, state::GatewayState};

    struct NullBus;

    #[async_trait]
    impl Bus for NullBus {
        async fn publish(&self, _channel: &str, _message: PubSubMessage) -> revurb_pubsub::Result<u64> {
            Ok(0)
        }

        async fn subscribe(&self, _channel: &str) -> revurb_pubsub::Result<tokio::sync::mpsc::UnboundedReceiver<PubSubMessage>> {
            let (_tx, rx) = tokio::sync::mpsc::unbounded_channel();
            Ok(rx)
        }
    }

    fn test_state() -> Arc<GatewayState> {
        let registry = AppRegistry::build(vec![revurb_config::ApplicationConfig {
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
        .unwrap();
        GatewayState::new(registry, EventDispatcher::new(None, "revurb"))
    }

    #[tokio::test]
    async fn client_originated_bus_message_does_not_update_cache() {
        let state = test_state();
        let bus: Arc<dyn Bus> = Arc::new(NullBus);
        let app = state.registry.find_by_id("1").unwrap();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let conn = Arc::new(Connection::new("c1".into(), app, "http://x".into(), tx));
        state
            .channel_manager("1")
            .subscribe(&conn, "cache-prices", "appkey", "appsecret", None, None)
            .unwrap();

        let message = PubSubMessage::Message {
            application_id: "1".into(),
            channel: "cache-prices".into(),
            event_payload: json!({ "event": "client-typing", "data": {"p": 1} }),
            except_socket_id: None,
            from_client: true,
        };
        handle_message(&state, &bus, "revurb", message).await;

        let channel = state.channel_manager("1").find("cache-prices").unwrap();
        assert!(!channel.has_cached_payload());
    }

    #[tokio::test]
    async fn externally_originated_bus_message_updates_cache() {
        let state = test_state();
        let bus: Arc<dyn Bus> = Arc::new(NullBus);
        let app = state.registry.find_by_id("1").unwrap();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let conn = Arc::new(Connection::new("c1".into(), app, "http://x".into(), tx));
        state
            .channel_manager("1")
            .subscribe(&conn, "cache-prices", "appkey", "appsecret", None, None)
            .unwrap();

        let message = PubSubMessage::Message {
            application_id: "1".into(),
            channel: "cache-prices".into(),
            event_payload: json!({ "event": "tick", "data": {"p": 42} }),
            except_socket_id: None,
            from_client: false,
        };
        handle_message(&state, &bus, "revurb", message).await;

        let channel = state.channel_manager("1").find("cache-prices").unwrap();
        assert!(channel.has_cached_payload());
    }
}
