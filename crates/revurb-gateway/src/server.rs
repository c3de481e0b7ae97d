//! Process wiring (spec §4.9, §4.10, §4.11, §10.1): assembles the axum
//! `Router` — WebSocket upgrade, HTTP control API, and a `/metrics` scrape
//! endpoint — and serves it to completion under graceful shutdown.
//! Grounded on the teacher's TCP-bind / `axum::serve` tail of
//! `start_gateway` in `server.rs`.

use std::{net::SocketAddr, sync::Arc};

use axum::{Router, routing::get};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::trace::TraceLayer;

use crate::{error::Error, http_api, state::GatewayState, ws};

/// Installs the process-wide Prometheus recorder the `metrics` crate's
/// macros (`counter!`, `gauge!`, `histogram!`) publish into. Call once at
/// startup; the returned handle renders the current snapshot for
/// `/metrics`.
pub fn install_metrics_recorder() -> Result<PrometheusHandle, Error> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .map_err(|error| Error::message(error.to_string()))
}

pub fn router(state: Arc<GatewayState>, metrics_handle: Option<PrometheusHandle>) -> Router {
    let ws_router = Router::new().route("/app/{app_key}", get(ws::upgrade)).with_state(state.clone());
    let metrics_router = Router::new().route(
        "/metrics",
        get(move || {
            let handle = metrics_handle.clone();
            async move { handle.map(|h| h.render()).unwrap_or_default() }
        }),
    );

    Router::new()
        .merge(ws_router)
        .merge(http_api::router(state))
        .merge(metrics_router)
        .layer(TraceLayer::new_for_http())
}

/// Binds `addr` and serves `router` until [`GatewayState::shutdown`] is
/// cancelled, at which point `axum::serve`'s graceful shutdown stops
/// accepting new connections (spec §4.11).
pub async fn serve(addr: SocketAddr, router: Router, state: Arc<GatewayState>) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "revurb listening");
    let shutdown = state.shutdown.clone();
    axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
