use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The envelope every Pusher wire message shares, in both directions.
/// `data` is decoded lazily: callers re-parse it into a concrete shape once
/// they know which event it belongs to, since `data` may legally be either
/// a JSON object or a JSON-encoded string (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawFrame {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Payload nested under `data` for `pusher:subscribe`.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscribeData {
    pub channel: String,
    #[serde(default)]
    pub auth: Option<String>,
    #[serde(default)]
    pub channel_data: Option<String>,
}

/// Payload nested under `data` for `pusher:unsubscribe`.
#[derive(Debug, Clone, Deserialize)]
pub struct UnsubscribeData {
    pub channel: String,
}

/// Payload nested under `data` for `pusher:signin`.
#[derive(Debug, Clone, Deserialize)]
pub struct SigninData {
    pub auth: String,
    pub user_data: String,
}

/// `channel_data` decoded for presence channels: `{ user_id, user_info? }`.
/// `user_id` accepts either a JSON string or number and is coerced to
/// string, per spec §4.3.
#[derive(Debug, Clone, Deserialize)]
pub struct PresenceChannelData {
    #[serde(deserialize_with = "deserialize_user_id")]
    pub user_id: String,
    #[serde(default)]
    pub user_info: Option<Value>,
}

fn deserialize_user_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum UserId {
        Str(String),
        Num(serde_json::Number),
    }
    match UserId::deserialize(deserializer)? {
        UserId::Str(s) => Ok(s),
        UserId::Num(n) => Ok(n.to_string()),
    }
}

/// A decoded inbound frame, dispatched on by the event handler /
/// client-event handler. Built from a [`RawFrame`] by [`ClientFrame::decode`].
#[derive(Debug, Clone)]
pub enum ClientFrame {
    Ping,
    Pong,
    Subscribe(SubscribeData),
    Unsubscribe(UnsubscribeData),
    Signin(SigninData),
    /// A `client-…` event on a channel the sender must already occupy.
    Client {
        event: String,
        channel: String,
        data: Value,
    },
    /// Any other `pusher:*`/`pusher_internal:*` event, or a malformed one:
    /// always translated to protocol error 4009 by the event handler.
    Unknown { event: String },
}

impl ClientFrame {
    pub fn decode(raw: RawFrame) -> Self {
        match raw.event.as_str() {
            "pusher:ping" => ClientFrame::Ping,
            "pusher:pong" => ClientFrame::Pong,
            "pusher:subscribe" => match raw
                .data
                .and_then(|d| serde_json::from_value::<SubscribeData>(d).ok())
            {
                Some(data) => ClientFrame::Subscribe(data),
                None => ClientFrame::Unknown { event: raw.event },
            },
            "pusher:unsubscribe" => match raw
                .data
                .and_then(|d| serde_json::from_value::<UnsubscribeData>(d).ok())
            {
                Some(data) => ClientFrame::Unsubscribe(data),
                None => ClientFrame::Unknown { event: raw.event },
            },
            "pusher:signin" => match raw
                .data
                .and_then(|d| serde_json::from_value::<SigninData>(d).ok())
            {
                Some(data) => ClientFrame::Signin(data),
                None => ClientFrame::Unknown { event: raw.event },
            },
            event if event.starts_with("client-") => match raw.channel {
                Some(channel) => ClientFrame::Client {
                    event: event.to_string(),
                    channel,
                    data: raw.data.unwrap_or(Value::Null),
                },
                None => ClientFrame::Unknown {
                    event: event.to_string(),
                },
            },
            event => ClientFrame::Unknown {
                event: event.to_string(),
            },
        }
    }
}

/// Server-originated frames. Each constructor returns a [`RawFrame`] ready
/// to serialize and push down the connection's send channel.
pub struct ServerFrame;

impl ServerFrame {
    pub fn connection_established(socket_id: &str, activity_timeout: u64) -> RawFrame {
        RawFrame {
            event: "pusher:connection_established".into(),
            channel: None,
            data: Some(serde_json::json!({
                "socket_id": socket_id,
                "activity_timeout": activity_timeout,
            })),
        }
    }

    pub fn pong() -> RawFrame {
        RawFrame {
            event: "pusher:pong".into(),
            channel: None,
            data: None,
        }
    }

    /// Server-initiated ping sent to an INACTIVE connection by the
    /// lifecycle ping job (spec §4.11); the client is expected to reply
    /// with `pusher:pong`.
    pub fn ping() -> RawFrame {
        RawFrame {
            event: "pusher:ping".into(),
            channel: None,
            data: None,
        }
    }

    pub fn error(code: u32, message: impl Into<String>) -> RawFrame {
        RawFrame {
            event: "pusher:error".into(),
            channel: None,
            data: Some(serde_json::json!({ "code": code, "message": message.into() })),
        }
    }

    pub fn subscription_succeeded(channel: &str, data: Value) -> RawFrame {
        RawFrame {
            event: "pusher_internal:subscription_succeeded".into(),
            channel: Some(channel.to_string()),
            data: Some(data),
        }
    }

    pub fn subscription_error(channel: &str, kind: &str, error: &str, status: u32) -> RawFrame {
        RawFrame {
            event: "pusher_internal:subscription_error".into(),
            channel: Some(channel.to_string()),
            data: Some(serde_json::json!({
                "type": kind,
                "error": error,
                "status": status,
            })),
        }
    }

    pub fn member_added(channel: &str, user_id: &str, user_info: Option<Value>) -> RawFrame {
        RawFrame {
            event: "pusher_internal:member_added".into(),
            channel: Some(channel.to_string()),
            data: Some(serde_json::json!({ "user_id": user_id, "user_info": user_info })),
        }
    }

    pub fn member_removed(channel: &str, user_id: &str) -> RawFrame {
        RawFrame {
            event: "pusher_internal:member_removed".into(),
            channel: Some(channel.to_string()),
            data: Some(serde_json::json!({ "user_id": user_id })),
        }
    }

    pub fn cache_miss(channel: &str) -> RawFrame {
        RawFrame {
            event: "pusher:cache_miss".into(),
            channel: Some(channel.to_string()),
            data: None,
        }
    }

    pub fn signin_success(user_data: &str) -> RawFrame {
        RawFrame {
            event: "pusher:signin_success".into(),
            channel: None,
            data: Some(serde_json::json!({ "user_data": user_data })),
        }
    }

    pub fn event(channel: &str, event: &str, data: Value) -> RawFrame {
        RawFrame {
            event: event.to_string(),
            channel: Some(channel.to_string()),
            data: Some(data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_ping() {
        let raw = RawFrame {
            event: "pusher:ping".into(),
            channel: None,
            data: None,
        };
        assert!(matches!(ClientFrame::decode(raw), ClientFrame::Ping));
    }

    #[test]
    fn decodes_subscribe() {
        let raw = RawFrame {
            event: "pusher:subscribe".into(),
            channel: None,
            data: Some(serde_json::json!({ "channel": "room-1" })),
        };
        match ClientFrame::decode(raw) {
            ClientFrame::Subscribe(data) => assert_eq!(data.channel, "room-1"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn decodes_client_event() {
        let raw = RawFrame {
            event: "client-typing".into(),
            channel: Some("private-room".into()),
            data: Some(serde_json::json!({ "is_typing": true })),
        };
        match ClientFrame::decode(raw) {
            ClientFrame::Client { event, channel, .. } => {
                assert_eq!(event, "client-typing");
                assert_eq!(channel, "private-room");
            },
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_control_event_falls_back() {
        let raw = RawFrame {
            event: "pusher:frobnicate".into(),
            channel: None,
            data: None,
        };
        assert!(matches!(
            ClientFrame::decode(raw),
            ClientFrame::Unknown { .. }
        ));
    }

    #[test]
    fn presence_channel_data_coerces_numeric_user_id() {
        let value = serde_json::json!({ "user_id": 42, "user_info": { "name": "Ada" } });
        let data: PresenceChannelData = serde_json::from_value(value).unwrap();
        assert_eq!(data.user_id, "42");
    }

    #[test]
    fn raw_frame_roundtrips() {
        let frame = ServerFrame::error(4009, "bad auth");
        let json = serde_json::to_string(&frame).unwrap();
        let back: RawFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event, "pusher:error");
    }
}
