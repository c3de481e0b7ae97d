//! Integration tests driving the HTTP Control API through the real axum
//! `Router` with `tower::ServiceExt::oneshot` (spec §8 scenario 2, §10.4),
//! rather than calling handler functions directly — this exercises the
//! `require_signature` middleware exactly as a real request would.

use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    body::Body,
    http::{Request, StatusCode, header},
};
use revurb_common::signature::{control_plane_auth_string, sign_hex};
use revurb_config::{AppRegistry, ApplicationConfig};
use revurb_gateway::{EventDispatcher, GatewayState};
use serde_json::{Value, json};
use tower::ServiceExt;

const APP_ID: &str = "1";
const APP_KEY: &str = "appkey";
const APP_SECRET: &str = "appsecret";

fn test_state() -> std::sync::Arc<GatewayState> {
    let registry = AppRegistry::build(vec![ApplicationConfig {
        id: APP_ID.into(),
        key: APP_KEY.into(),
        secret: APP_SECRET.into(),
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

fn signed_request(method: &str, path: &str, body: &[u8]) -> Request<Body> {
    let timestamp = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
    let canonical_query = format!("auth_key={APP_KEY}&auth_timestamp={timestamp}&auth_version=1.0");
    let to_sign = control_plane_auth_string(method, path, &canonical_query, body);
    let signature = sign_hex(APP_SECRET, &to_sign).unwrap();
    let uri = format!("{path}?{canonical_query}&auth_signature={signature}");
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_vec()))
        .unwrap()
}

#[tokio::test]
async fn health_check_requires_no_signature() {
    let router = revurb_gateway::http_api::router(test_state());
    let response = router.oneshot(Request::builder().uri("/up").body(Body::empty()).unwrap()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn trigger_event_rejects_missing_signature() {
    let router = revurb_gateway::http_api::router(test_state());
    let body = json!({"name":"greet","channels":["room-1"],"data":{"hi":1}}).to_string();
    let request = Request::builder()
        .method("POST")
        .uri(format!("/apps/{APP_ID}/events"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn trigger_event_rejects_tampered_signature() {
    let router = revurb_gateway::http_api::router(test_state());
    let path = format!("/apps/{APP_ID}/events");
    let body = json!({"name":"greet","channels":["room-1"],"data":{"hi":1}}).to_string();
    let mut request = signed_request("POST", &path, body.as_bytes());
    *request.uri_mut() = format!("{}&x=tamper", request.uri()).parse().unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn trigger_event_accepts_valid_signature_and_dispatches() {
    let state = test_state();
    let manager = state.channel_manager(APP_ID);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let app = state.registry.find_by_id(APP_ID).unwrap();
    let conn = std::sync::Arc::new(revurb_gateway::Connection::new("c1".into(), app, "http://x".into(), tx));
    manager.subscribe(&conn, "room-1", APP_KEY, APP_SECRET, None, None).unwrap();

    let router = revurb_gateway::http_api::router(state);
    let path = format!("/apps/{APP_ID}/events");
    let body = json!({"name":"greet","channels":["room-1"],"data":{"hi":1}}).to_string();
    let request = signed_request("POST", &path, body.as_bytes());
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let message = rx.recv().await.expect("subscriber should receive the broadcast");
    let axum::extract::ws::Message::Text(text) = message else {
        panic!("expected a text frame");
    };
    let frame: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(frame["event"], "greet");
    assert_eq!(frame["channel"], "room-1");
}

#[tokio::test]
async fn list_channels_reflects_local_subscriptions() {
    let state = test_state();
    let manager = state.channel_manager(APP_ID);
    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let app = state.registry.find_by_id(APP_ID).unwrap();
    let conn = std::sync::Arc::new(revurb_gateway::Connection::new("c1".into(), app, "http://x".into(), tx));
    manager.subscribe(&conn, "room-1", APP_KEY, APP_SECRET, None, None).unwrap();

    let router = revurb_gateway::http_api::router(state);
    let path = format!("/apps/{APP_ID}/channels");
    let request = signed_request("GET", &path, b"");
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert!(body["channels"].as_object().unwrap().contains_key("room-1"));
}

#[tokio::test]
async fn terminate_unknown_user_is_idempotent() {
    let state = test_state();
    let router = revurb_gateway::http_api::router(state);
    let path = format!("/apps/{APP_ID}/users/no-such-user/terminate_connections");
    let request = signed_request("DELETE", &path, b"");
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
