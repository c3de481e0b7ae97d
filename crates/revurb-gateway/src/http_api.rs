//! The HTTP Control API (spec §4.10): the plane operators and application
//! backends use to trigger events and inspect channel state, sharing the
//! same [`GatewayState`] the WebSocket server mutates. Grounded on the
//! teacher's `health_handler` (`/up` returns a small JSON status object)
//! and its `auth_middleware.rs` layering convention, generalized here into
//! a signature-verifying `axum::middleware::from_fn_with_state`.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use revurb_common::signature;
use revurb_pubsub::PubSubMessage;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{dispatcher::Origin, event_handler, metrics, state::GatewayState};

const MAX_CONTROL_BODY_BYTES: usize = 1_000_000;
const MAX_AUTH_SKEW_SECONDS: i64 = 600;

pub fn router(state: Arc<GatewayState>) -> Router {
    let apps = Router::new()
        .route("/channels", get(list_channels))
        .route("/channels/{channel}", get(channel_detail))
        .route("/channels/{channel}/users", get(channel_users))
        .route("/connections", get(connections))
        .route("/events", post(trigger_event))
        .route("/batch_events", post(batch_events))
        .route("/users/{user_id}/terminate_connections", delete(terminate_connections))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_signature));

    Router::new().route("/up", get(up)).nest("/apps/{app_id}", apps).with_state(state)
}

async fn up() -> Json<Value> {
    Json(json!({ "health": "OK" }))
}

/// Recomputes the HMAC-SHA256 request signature from the raw request —
/// method, path, sorted query pairs minus `auth_signature`, md5 of the
/// body bytes — and rejects before any handler runs (spec §4.10).
async fn require_signature(State(state): State<Arc<GatewayState>>, Path(params): Path<HashMap<String, String>>, req: Request, next: Next) -> Response {
    let app_id = params.get("app_id").cloned().unwrap_or_default();
    let app = match state.registry.find_by_id(&app_id) {
        Ok(app) => app,
        Err(_) => return ApiError::NotFound("unknown application".into()).into_response(),
    };

    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let mut pairs: Vec<(String, String)> = req
        .uri()
        .query()
        .unwrap_or("")
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let given: HashMap<&str, &str> = pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();

    let (Some(auth_key), Some(auth_timestamp), Some(_), Some(auth_signature)) = (
        given.get("auth_key"),
        given.get("auth_timestamp"),
        given.get("auth_version"),
        given.get("auth_signature"),
    ) else {
        return ApiError::Unauthorized("missing auth_key, auth_timestamp, auth_version, or auth_signature".into()).into_response();
    };
    if *auth_key != app.key {
        return ApiError::Unauthorized("auth_key does not match application".into()).into_response();
    }
    let Ok(timestamp) = auth_timestamp.parse::<i64>() else {
        return ApiError::Forbidden("auth_timestamp is not a valid unix timestamp".into()).into_response();
    };
    if (now_unix() - timestamp).abs() > MAX_AUTH_SKEW_SECONDS {
        return ApiError::Forbidden("auth_timestamp skew exceeds 600 seconds".into()).into_response();
    }
    let auth_signature = auth_signature.to_string();

    pairs.retain(|(k, _)| k != "auth_signature");
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    let canonical_query = pairs.into_iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join("&");

    let (parts, body) = req.into_parts();
    let body_bytes = match axum::body::to_bytes(body, MAX_CONTROL_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => return ApiError::BadRequest("body exceeds maximum control-plane size".into()).into_response(),
    };
    if !signature::verify_control_plane_signature(app.secret(), &method, &path, &canonical_query, &body_bytes, &auth_signature) {
        return ApiError::Forbidden("invalid auth_signature".into()).into_response();
    }

    let req = Request::from_parts(parts, Body::from(body_bytes));
    next.run(req).await
}

fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

#[derive(Debug, Default, Deserialize)]
struct ChannelsQuery {
    #[serde(default)]
    filter_by_prefix: Option<String>,
    #[serde(default)]
    info: Option<String>,
}

async fn list_channels(State(state): State<Arc<GatewayState>>, Path(app_id): Path<String>, Query(query): Query<ChannelsQuery>) -> Result<Json<Value>, ApiError> {
    let app = find_app(&state, &app_id)?;
    let fields = metrics::parse_info_fields(query.info.as_deref());
    let local = metrics::local_channels(&state.channel_manager(&app.id), query.filter_by_prefix.as_deref(), &fields);
    if !state.dispatcher.scaling_enabled() {
        return Ok(Json(local));
    }
    let options = json!({ "filter_by_prefix": query.filter_by_prefix, "info": query.info });
    let replies = state.metrics.gather_fleet(&state.dispatcher, &app.id, "channels", options).await;
    Ok(Json(merge_channel_lists(local, replies)))
}

async fn channel_detail(
    State(state): State<Arc<GatewayState>>,
    Path((app_id, channel)): Path<(String, String)>,
    Query(query): Query<ChannelsQuery>,
) -> Result<Json<Value>, ApiError> {
    let app = find_app(&state, &app_id)?;
    let fields = metrics::parse_info_fields(query.info.as_deref());
    let manager = state.channel_manager(&app.id);
    let mut local = match manager.find(&channel) {
        Some(found) => {
            let mut summary = metrics::channel_summary(&found, &fields);
            summary["occupied"] = Value::Bool(true);
            summary
        },
        None => json!({ "occupied": false }),
    };
    if state.dispatcher.scaling_enabled() {
        let options = json!({ "channel": channel, "info": query.info });
        let replies = state.metrics.gather_fleet(&state.dispatcher, &app.id, "channel", options).await;
        merge_channel_info(&mut local, &replies);
    }
    Ok(Json(local))
}

async fn channel_users(State(state): State<Arc<GatewayState>>, Path((app_id, channel)): Path<(String, String)>) -> Result<Json<Value>, ApiError> {
    let app = find_app(&state, &app_id)?;
    let manager = state.channel_manager(&app.id);
    let found = manager.find(&channel).ok_or_else(|| ApiError::NotFound("channel not found".into()))?;
    if !found.kind.is_presence() {
        return Err(ApiError::BadRequest("channel is not a presence channel".into()));
    }
    let mut ids: std::collections::BTreeSet<String> = found.presence_user_ids().into_iter().collect();
    if state.dispatcher.scaling_enabled() {
        let options = json!({ "channel": channel });
        let replies = state.metrics.gather_fleet(&state.dispatcher, &app.id, "channel_users", options).await;
        for reply in replies {
            if let Some(users) = reply.get("users").and_then(Value::as_array) {
                for user in users {
                    if let Some(id) = user.get("id").and_then(Value::as_str) {
                        ids.insert(id.to_string());
                    }
                }
            }
        }
    }
    Ok(Json(json!({ "users": ids.into_iter().map(|id| json!({ "id": id })).collect::<Vec<_>>() })))
}

async fn connections(State(state): State<Arc<GatewayState>>, Path(app_id): Path<String>) -> Result<Json<Value>, ApiError> {
    let app = find_app(&state, &app_id)?;
    let local_count = u64::from(state.connection_count(&app.id));
    if !state.dispatcher.scaling_enabled() {
        return Ok(Json(json!({ "count": local_count })));
    }
    let replies = state.metrics.gather_fleet(&state.dispatcher, &app.id, "connections", Value::Null).await;
    let fleet_count: u64 = replies.iter().filter_map(|reply| reply.get("count").and_then(Value::as_u64)).sum();
    Ok(Json(json!({ "count": local_count + fleet_count })))
}

#[derive(Debug, Deserialize)]
struct TriggerBody {
    name: String,
    channels: Vec<String>,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    socket_id: Option<String>,
}

async fn trigger_event(State(state): State<Arc<GatewayState>>, Path(app_id): Path<String>, Json(body): Json<TriggerBody>) -> Result<Json<Value>, ApiError> {
    let app = find_app(&state, &app_id)?;
    if body.channels.is_empty() {
        return Err(ApiError::BadRequest("channels must not be empty".into()));
    }
    let manager = state.channel_manager(&app.id);
    for channel in &body.channels {
        state
            .dispatcher
            .dispatch(&manager, &app.id, channel, &body.name, &body.data, body.socket_id.as_deref(), Origin::External, false)
            .await;
    }
    Ok(Json(json!({})))
}

#[derive(Debug, Deserialize)]
struct BatchItem {
    name: String,
    channel: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    socket_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BatchBody {
    batch: Vec<BatchItem>,
}

async fn batch_events(State(state): State<Arc<GatewayState>>, Path(app_id): Path<String>, Json(body): Json<BatchBody>) -> Result<Json<Value>, ApiError> {
    let app = find_app(&state, &app_id)?;
    let manager = state.channel_manager(&app.id);
    for item in body.batch {
        state
            .dispatcher
            .dispatch(&manager, &app.id, &item.channel, &item.name, &item.data, item.socket_id.as_deref(), Origin::External, false)
            .await;
    }
    Ok(Json(json!({})))
}

async fn terminate_connections(State(state): State<Arc<GatewayState>>, Path((app_id, user_id)): Path<(String, String)>) -> Result<Json<Value>, ApiError> {
    let app = find_app(&state, &app_id)?;
    event_handler::terminate_user(&state, &app.id, &user_id);
    if let Some(bus) = state.dispatcher.bus() {
        let message = PubSubMessage::Terminate {
            application_id: app.id.clone(),
            user_id: user_id.clone(),
        };
        if let Err(error) = bus.publish(state.dispatcher.bus_channel(), message).await {
            tracing::warn!(%error, app_id = %app.id, %user_id, "failed to publish terminate to bus");
        }
    }
    Ok(Json(json!({})))
}

fn find_app(state: &GatewayState, app_id: &str) -> Result<Arc<revurb_config::Application>, ApiError> {
    state.registry.find_by_id(app_id).map_err(|_| ApiError::NotFound("unknown application".into()))
}

/// Merges one node's local `{"channels": {...}}` listing with every
/// fleet reply of the same shape (spec §4.12): union of channel names,
/// summing `subscription_count`/`user_count`, OR-ing `cache`.
fn merge_channel_lists(local: Value, replies: Vec<Value>) -> Value {
    let mut channels = local.get("channels").and_then(Value::as_object).cloned().unwrap_or_default();
    for reply in replies {
        let Some(reply_channels) = reply.get("channels").and_then(Value::as_object) else {
            continue;
        };
        for (name, info) in reply_channels {
            channels
                .entry(name.clone())
                .and_modify(|existing| merge_counts(existing, info))
                .or_insert_with(|| info.clone());
        }
    }
    json!({ "channels": Value::Object(channels) })
}

/// Merges a single channel-detail reply into `local` in place.
fn merge_channel_info(local: &mut Value, replies: &[Value]) {
    for reply in replies {
        if reply.get("occupied").and_then(Value::as_bool) == Some(true) {
            local["occupied"] = Value::Bool(true);
        }
        merge_counts(local, reply);
    }
}

fn merge_counts(existing: &mut Value, other: &Value) {
    let (Some(existing_obj), Some(other_obj)) = (existing.as_object_mut(), other.as_object()) else {
        return;
    };
    for key in ["subscription_count", "user_count"] {
        if let Some(addend) = other_obj.get(key).and_then(Value::as_i64) {
            let current = existing_obj.get(key).and_then(Value::as_i64).unwrap_or(0);
            existing_obj.insert(key.to_string(), Value::from(current + addend));
        }
    }
    if other_obj.get("cache").and_then(Value::as_bool) == Some(true) {
        existing_obj.insert("cache".to_string(), Value::Bool(true));
    }
}

#[derive(Debug)]
enum ApiError {
    NotFound(String),
    Unauthorized(String),
    Forbidden(String),
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Unauthorized(m) => (StatusCode::UNAUTHORIZED, m),
            ApiError::Forbidden(m) => (StatusCode::FORBIDDEN, m),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_fleet_channel_counts() {
        let local = json!({ "channels": { "room-1": { "subscription_count": 2 } } });
        let replies = vec![json!({ "channels": { "room-1": { "subscription_count": 3 }, "room-2": { "subscription_count": 1 } } })];
        let merged = merge_channel_lists(local, replies);
        assert_eq!(merged["channels"]["room-1"]["subscription_count"], 5);
        assert_eq!(merged["channels"]["room-2"]["subscription_count"], 1);
    }

    #[test]
    fn merges_occupied_flag_across_fleet() {
        let mut local = json!({ "occupied": false });
        merge_channel_info(&mut local, &[json!({ "occupied": true })]);
        assert_eq!(local["occupied"], true);
    }
}
