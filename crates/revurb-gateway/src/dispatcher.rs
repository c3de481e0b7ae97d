//! The Event Dispatcher (spec §4.7): the single place an event — whether
//! triggered over the HTTP control plane or fanned out by a client —
//! turns into either a local broadcast or a bus publish.

use std::sync::Arc;

use revurb_pubsub::{Bus, PubSubMessage};
use serde_json::Value;

use crate::channel_manager::ChannelManager;

/// Whether the event defines a cache channel's "current state" (spec
/// §4.3): externally-originated events (HTTP triggers, and events arriving
/// back off the bus) update the cache; client-originated chatter does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    External,
    ClientEvent,
}

pub struct EventDispatcher {
    bus: Option<Arc<dyn Bus>>,
    bus_channel: String,
}

impl EventDispatcher {
    pub fn new(bus: Option<Arc<dyn Bus>>, bus_channel: impl Into<String>) -> Self {
        Self {
            bus,
            bus_channel: bus_channel.into(),
        }
    }

    pub fn scaling_enabled(&self) -> bool {
        self.bus.is_some()
    }

    /// Dispatches `event`/`data` on `channel_name` within `application_id`.
    ///
    /// `from_bus` distinguishes a message already routed here by the
    /// pub/sub bridge (§4.8) from one originating locally on this node —
    /// only locally-originated events get published, since every node
    /// (including the one that published it) delivers locally once the
    /// bridge reads it back off the bus. In single-node mode (no bus
    /// configured) every event is delivered locally immediately.
    ///
    /// `origin` travels with the published `PubSubMessage::Message` (its
    /// `from_client` field) so every other node's bridge re-dispatches
    /// with the same `Origin` this node was given — a cache channel's
    /// `last_payload` must only change for externally-originated events,
    /// not `client-*` chatter, on every node in the fleet, not just this one.
    pub async fn dispatch(
        &self,
        channel_manager: &ChannelManager,
        application_id: &str,
        channel_name: &str,
        event: &str,
        data: &Value,
        except: Option<&str>,
        origin: Origin,
        from_bus: bool,
    ) {
        if self.bus.is_none() || from_bus {
            let Some(channel) = channel_manager.find(channel_name) else {
                return;
            };
            match origin {
                Origin::External => channel.broadcast(event, data, except),
                Origin::ClientEvent => channel.broadcast_internally(event, data, except),
            }
            return;
        }

        let Some(bus) = &self.bus else { return };
        let message = PubSubMessage::Message {
            application_id: application_id.to_string(),
            channel: channel_name.to_string(),
            event_payload: serde_json::json!({ "event": event, "data": data }),
            except_socket_id: except.map(|s| s.to_string()),
            from_client: origin == Origin::ClientEvent,
        };
        if let Err(error) = bus.publish(&self.bus_channel, message).await {
            tracing::warn!(%error, application_id, channel_name, "failed to publish event to bus");
        }
    }

    pub async fn publish_metrics_request(&self, message: PubSubMessage) -> revurb_pubsub::Result<u64> {
        match &self.bus {
            Some(bus) => bus.publish(&self.bus_channel, message).await,
            None => Ok(0),
        }
    }

    pub fn bus_channel(&self) -> &str {
        &self.bus_channel
    }

    pub fn bus(&self) -> Option<&Arc<dyn Bus>> {
        self.bus.as_ref()
    }
}
