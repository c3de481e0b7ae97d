//! Serde-derived shapes for `revurb.toml`. These are the raw, unvalidated
//! forms; [`crate::registry::AppRegistry`] turns [`ApplicationConfig`] into
//! the immutable [`crate::registry::Application`] the core actually uses.

use serde::{Deserialize, Serialize};

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    6001
}
fn default_shutdown_drain_seconds() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_shutdown_drain_seconds")]
    pub shutdown_drain_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            shutdown_drain_seconds: default_shutdown_drain_seconds(),
        }
    }
}

fn default_ping_interval() -> u64 {
    120
}
fn default_activity_timeout() -> u64 {
    30
}
fn default_allowed_origins() -> Vec<String> {
    vec!["*".to_string()]
}
fn default_max_message_size() -> usize {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    pub id: String,
    pub key: String,
    pub secret: String,
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    #[serde(default = "default_activity_timeout")]
    pub activity_timeout: u64,
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default)]
    pub max_connections: Option<u32>,
    #[serde(default)]
    pub options: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Local,
    Redis,
}

impl Default for BusKind {
    fn default() -> Self {
        BusKind::Local
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScalingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bus: BusKind,
    #[serde(default)]
    pub url: Option<String>,
    /// Bus channel name all nodes publish/subscribe to (spec §6).
    #[serde(default = "default_bus_channel")]
    pub channel: String,
}

fn default_bus_channel() -> String {
    "revurb".to_string()
}

fn default_ping_job_seconds() -> u64 {
    60
}
fn default_prune_job_seconds() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalsConfig {
    #[serde(default = "default_ping_job_seconds")]
    pub ping_seconds: u64,
    #[serde(default = "default_prune_job_seconds")]
    pub prune_seconds: u64,
}

impl Default for IntervalsConfig {
    fn default() -> Self {
        Self {
            ping_seconds: default_ping_job_seconds(),
            prune_seconds: default_prune_job_seconds(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RevurbConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub apps: Vec<ApplicationConfig>,
    #[serde(default)]
    pub scaling: ScalingConfig,
    #[serde(default)]
    pub intervals: IntervalsConfig,
}
