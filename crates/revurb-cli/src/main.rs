//! The `revurb` binary: loads configuration, wires up the gateway, and
//! runs it to completion. Grounded on the teacher's `#[tokio::main] async
//! fn main() -> anyhow::Result<()>` shape and its `init_telemetry`
//! (`tracing_subscriber::registry` + `EnvFilter` + optional JSON layer) in
//! `cli/src/main.rs`, trimmed to the handful of flags a single-purpose
//! broker needs instead of the teacher's many unrelated subcommands.

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Revurb: a real-time WebSocket broker implementing the Pusher wire protocol.
#[derive(Parser, Debug)]
#[command(name = "revurb", version, about)]
struct Cli {
    /// Path to revurb.toml. Falls back to standard discovery when unset.
    #[arg(long, env = "REVURB_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `server.bind` from the config file.
    #[arg(long)]
    bind: Option<String>,

    /// Overrides `server.port` from the config file.
    #[arg(long)]
    port: Option<u16>,

    /// `tracing_subscriber::EnvFilter` directive, e.g. `revurb=debug,tower_http=info`.
    #[arg(long, env = "REVURB_LOG", default_value = "info")]
    log_level: String,

    /// Emit structured JSON logs instead of human-readable ones.
    #[arg(long, env = "REVURB_LOG_JSON")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli.log_level, cli.json_logs);

    let mut config = revurb_config::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    let registry = revurb_config::AppRegistry::build(config.apps.clone()).context("building application registry")?;

    let bus: Option<Arc<dyn revurb_pubsub::Bus>> = if config.scaling.enabled {
        let url = config.scaling.url.as_deref().context("scaling.enabled requires scaling.url to be set")?;
        let redis_bus = revurb_pubsub::RedisBus::connect(url).await.context("connecting to pub/sub bus")?;
        Some(Arc::new(redis_bus))
    } else {
        None
    };

    let dispatcher = revurb_gateway::EventDispatcher::new(bus, config.scaling.channel.clone());
    let state = revurb_gateway::GatewayState::new(registry, dispatcher);

    let metrics_handle = match revurb_gateway::server::install_metrics_recorder() {
        Ok(handle) => Some(handle),
        Err(error) => {
            tracing::warn!(%error, "failed to install metrics recorder, /metrics will be empty");
            None
        },
    };
    let router = revurb_gateway::server::router(state.clone(), metrics_handle);

    let sweep_period = Duration::from_secs(config.intervals.ping_seconds.min(config.intervals.prune_seconds).max(1));
    tokio::spawn(revurb_gateway::lifecycle::run_periodic_jobs(state.clone(), sweep_period));

    if state.dispatcher.scaling_enabled() {
        tokio::spawn(revurb_gateway::pubsub_bridge::run(state.clone()));
    }

    let signal_state = state.clone();
    tokio::spawn(async move {
        revurb_gateway::lifecycle::wait_for_shutdown_signal(&signal_state).await;
    });

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .context("parsing server.bind/server.port into a socket address")?;

    let serve_result = revurb_gateway::server::serve(addr, router, state.clone()).await;
    revurb_gateway::lifecycle::drain(&state, config.server.shutdown_drain_seconds).await;
    serve_result.context("gateway server exited with an error")?;
    Ok(())
}

fn init_telemetry(log_level: &str, json_logs: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let registry = tracing_subscriber::registry().with(filter);
    if json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
