//! The Metrics Aggregator (spec §4.12): local gathering straight from a
//! [`ChannelManager`], plus fleet-wide gathering over the pub/sub bus when
//! scaling is enabled.

use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use revurb_pubsub::PubSubMessage;
use serde_json::Value;

use crate::{channel::Channel, channel_manager::ChannelManager, dispatcher::EventDispatcher};

const FLEET_TIMEOUT: Duration = Duration::from_secs(10);

/// Collects `metrics-retrieved` replies for in-flight fleet-wide requests,
/// keyed by the random request key each request is tagged with.
pub struct MetricsAggregator {
    pending: DashMap<String, tokio::sync::mpsc::UnboundedSender<Value>>,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self { pending: DashMap::new() }
    }

    /// Called by the pub/sub bridge (§4.8) when a `metrics-retrieved`
    /// message arrives. Replies for unknown/expired request keys (arrived
    /// after the 10s window) are discarded, per spec.
    pub fn deliver_reply(&self, request_key: &str, payload: Value) {
        if let Some(tx) = self.pending.get(request_key) {
            let _ = tx.send(payload);
        }
    }

    /// Publishes a `metrics` request and collects `metrics-retrieved`
    /// replies until either every expected reply has arrived or 10s
    /// elapses (spec §4.12 steps 1-3, 5). Replies are raw JSON payloads;
    /// the caller merges them per metric type.
    pub async fn gather_fleet(
        &self,
        dispatcher: &EventDispatcher,
        application_id: &str,
        metric_type: &str,
        options: Value,
    ) -> Vec<Value> {
        let request_key = random_key();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        self.pending.insert(request_key.clone(), tx);

        let message = PubSubMessage::Metrics {
            application_id: application_id.to_string(),
            request_key: request_key.clone(),
            metric_type: metric_type.to_string(),
            options,
        };
        let expected = dispatcher.publish_metrics_request(message).await.unwrap_or(0);

        let mut replies = Vec::new();
        let deadline = tokio::time::Instant::now() + FLEET_TIMEOUT;
        while expected == 0 || (replies.len() as u64) < expected {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(payload)) => replies.push(payload),
                _ => break,
            }
        }
        self.pending.remove(&request_key);
        replies
    }
}

fn random_key() -> String {
    let mut rng = rand::rng();
    (0..16).map(|_| char::from(rng.sample(rand::distr::Alphanumeric))).collect()
}

// ── Local gathering ──────────────────────────────────────────────────────

/// Per-channel info requested via `?info=` on the channels endpoints
/// (spec §4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelInfoField {
    UserCount,
    SubscriptionCount,
    Cache,
}

pub fn parse_info_fields(info: Option<&str>) -> Vec<ChannelInfoField> {
    let Some(info) = info else { return Vec::new() };
    info.split(',')
        .filter_map(|field| match field.trim() {
            "user_count" => Some(ChannelInfoField::UserCount),
            "subscription_count" => Some(ChannelInfoField::SubscriptionCount),
            "cache" => Some(ChannelInfoField::Cache),
            _ => None,
        })
        .collect()
}

pub fn channel_summary(channel: &Channel, fields: &[ChannelInfoField]) -> Value {
    let mut map = serde_json::Map::new();
    for field in fields {
        match field {
            ChannelInfoField::UserCount if channel.kind.is_presence() => {
                map.insert("user_count".to_string(), channel.user_count().into());
            },
            ChannelInfoField::SubscriptionCount => {
                map.insert("subscription_count".to_string(), channel.member_count().into());
            },
            ChannelInfoField::Cache if channel.kind.is_cache() => {
                map.insert("cache".to_string(), channel.has_cached_payload().into());
            },
            _ => {},
        }
    }
    Value::Object(map)
}

pub fn local_channels(manager: &ChannelManager, filter_by_prefix: Option<&str>, fields: &[ChannelInfoField]) -> Value {
    let mut channels = serde_json::Map::new();
    for channel in manager.all() {
        if let Some(prefix) = filter_by_prefix
            && !channel.name.starts_with(prefix)
        {
            continue;
        }
        channels.insert(channel.name.clone(), channel_summary(&channel, fields));
    }
    serde_json::json!({ "channels": channels })
}
