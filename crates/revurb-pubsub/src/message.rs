//! The wire shape of messages exchanged on the bus (spec §3 PubSubMessage,
//! §4.7, §4.8, §4.12). Deliberately a plain tagged JSON object, not a
//! language-specific binary encoding, so a heterogeneous fleet (this
//! implementation alongside others) can interoperate.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "kebab-case")]
pub enum PubSubMessage {
    /// A channel event fanned out from one node, to be dispatched locally
    /// by every other node (spec §4.7/§4.8).
    Message {
        application_id: String,
        channel: String,
        event_payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        except_socket_id: Option<String>,
        /// Whether this event originated from a `client-*` event rather
        /// than an externally-triggered one (spec §4.3/§4.7): re-dispatch
        /// on every other node must preserve this so cache channels only
        /// update `last_payload` for externally-originated events.
        #[serde(default)]
        from_client: bool,
    },
    /// A fleet-wide metrics request (spec §4.12). `metric_type` names the
    /// metric (`"channels"`, `"channel"`, `"channel_users"`,
    /// `"connections"`); `options` carries metric-specific parameters
    /// (e.g. the channel name).
    Metrics {
        application_id: String,
        request_key: String,
        #[serde(rename = "type")]
        metric_type: String,
        #[serde(default)]
        options: Value,
    },
    /// One node's reply to a `Metrics` request, keyed by `request_key`.
    MetricsRetrieved { request_key: String, payload: Value },
    /// Close every local connection of `application_id` signed in as
    /// `user_id` (spec §4.8).
    Terminate { application_id: String, user_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_variant_round_trips() {
        let message = PubSubMessage::Message {
            application_id: "1".into(),
            channel: "room-1".into(),
            event_payload: serde_json::json!({"event": "greet", "data": "{}"}),
            except_socket_id: Some("s1".into()),
            from_client: false,
        };
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("\"tag\":\"message\""));
        let back: PubSubMessage = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, PubSubMessage::Message { .. }));
    }

    #[test]
    fn from_client_defaults_to_false_for_a_peer_on_an_older_wire_format() {
        let json = r#"{"tag":"message","application_id":"1","channel":"room-1","event_payload":{}}"#;
        let back: PubSubMessage = serde_json::from_str(json).unwrap();
        match back {
            PubSubMessage::Message { from_client, .. } => assert!(!from_client),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn from_client_flag_round_trips() {
        let message = PubSubMessage::Message {
            application_id: "1".into(),
            channel: "private-room".into(),
            event_payload: serde_json::json!({"event": "client-typing", "data": "{}"}),
            except_socket_id: None,
            from_client: true,
        };
        let json = serde_json::to_string(&message).unwrap();
        let back: PubSubMessage = serde_json::from_str(&json).unwrap();
        match back {
            PubSubMessage::Message { from_client, .. } => assert!(from_client),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn metrics_type_field_survives_the_outer_tag() {
        let message = PubSubMessage::Metrics {
            application_id: "1".into(),
            request_key: "k1".into(),
            metric_type: "channels".into(),
            options: Value::Null,
        };
        let json = serde_json::to_string(&message).unwrap();
        let back: PubSubMessage = serde_json::from_str(&json).unwrap();
        match back {
            PubSubMessage::Metrics { metric_type, .. } => assert_eq!(metric_type, "channels"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
