//! Lifecycle jobs (spec §4.11): the periodic ping/prune sweep and graceful
//! shutdown. Grounded on the teacher's periodic-tick task
//! (`tokio::time::interval` + `tokio::spawn`) and its `ctrl_c` shutdown
//! wait in `server.rs`, extended with SIGTERM — a production broker runs
//! under a process supervisor, not just a developer's terminal, and the
//! teacher's own `ctrl_c`-only wait would ignore that supervisor's signal.

use std::{sync::Arc, time::Duration};

use revurb_protocol::error_codes;

use crate::{connection::ConnectionState, event_handler, state::GatewayState};

/// Runs the ping-inactive/prune-stale sweep at `period` until shutdown is
/// signaled. Both jobs share one cadence (spec §4.11: "at the same
/// cadence"), so one ticker drives both.
pub async fn run_periodic_jobs(state: Arc<GatewayState>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            () = state.shutdown.cancelled() => break,
            _ = ticker.tick() => sweep(&state),
        }
    }
}

fn sweep(state: &Arc<GatewayState>) {
    for conn in state.all_connections() {
        match conn.state() {
            ConnectionState::Active => {},
            ConnectionState::Inactive => {
                conn.send_ping();
                conn.mark_pinged();
            },
            ConnectionState::Stale => {
                event_handler::unsubscribe_all_and_notify(state, &conn);
                conn.close(Some(error_codes::STALE_CONNECTION), Some("pong reply not received in time"));
            },
        }
    }
}

/// Waits for SIGINT or SIGTERM, then cancels [`GatewayState::shutdown`] so
/// every in-flight connection loop and periodic job observes it on their
/// next poll.
pub async fn wait_for_shutdown_signal(state: &Arc<GatewayState>) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            },
            Err(error) => {
                tracing::warn!(%error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT, shutting down"),
        () = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
    state.shutdown.cancel();
}

/// Closes every remaining connection with protocol error 4200 and waits
/// up to `drain_seconds` for their close handshakes to complete (spec
/// §4.11). Callers still exit after the deadline even if connections
/// remain — the drain is best-effort, not a hard requirement.
pub async fn drain(state: &Arc<GatewayState>, drain_seconds: u64) {
    for conn in state.all_connections() {
        conn.close(Some(error_codes::GENERIC), Some("server is shutting down"));
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(drain_seconds);
    while !state.all_connections().is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
