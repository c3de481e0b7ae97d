//! The Application Registry (spec §4.1): resolves tenant config by key or
//! id and is the single source of per-tenant policy. Built once at startup
//! from [`crate::schema::RevurbConfig::apps`] and never mutated afterward.

use std::{collections::HashMap, sync::Arc};

use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

use crate::{
    error::{Error, Result},
    schema::ApplicationConfig,
};

/// An immutable per-tenant record (spec §3). `secret` is wrapped in
/// [`SecretString`] so it never appears in a `{:?}` dump or accidentally
/// ends up in a log line.
#[derive(Debug, Clone)]
pub struct Application {
    pub id: String,
    pub key: String,
    secret: SecretString,
    pub ping_interval: u64,
    pub activity_timeout: u64,
    pub allowed_origins: Vec<String>,
    pub max_message_size: usize,
    pub max_connections: Option<u32>,
    pub options: Value,
}

impl Application {
    pub fn secret(&self) -> &str {
        self.secret.expose_secret()
    }

    fn from_config(cfg: ApplicationConfig) -> Result<Self> {
        if cfg.key.is_empty() || cfg.secret.is_empty() {
            return Err(Error::Invalid(format!(
                "application {:?} has an empty key or secret",
                cfg.id
            )));
        }
        Ok(Self {
            id: cfg.id,
            key: cfg.key,
            secret: SecretString::from(cfg.secret),
            ping_interval: cfg.ping_interval,
            activity_timeout: cfg.activity_timeout,
            allowed_origins: cfg.allowed_origins,
            max_message_size: cfg.max_message_size,
            max_connections: cfg.max_connections,
            options: cfg.options,
        })
    }
}

/// Resolves [`Application`]s by key (routing identity, used by the
/// WebSocket upgrade path) or id (used by the HTTP control plane).
/// Immutable after construction — reimplementers wanting hot-reload can
/// wrap this in `ArcSwap`; the core does not require it.
#[derive(Debug, Clone)]
pub struct AppRegistry {
    by_key: HashMap<String, Arc<Application>>,
    by_id: HashMap<String, Arc<Application>>,
}

impl AppRegistry {
    pub fn build(apps: Vec<ApplicationConfig>) -> Result<Self> {
        let mut by_key = HashMap::with_capacity(apps.len());
        let mut by_id = HashMap::with_capacity(apps.len());
        for cfg in apps {
            let app = Arc::new(Application::from_config(cfg)?);
            if by_key.contains_key(&app.key) {
                return Err(Error::Invalid(format!(
                    "duplicate application key: {}",
                    app.key
                )));
            }
            by_key.insert(app.key.clone(), app.clone());
            by_id.insert(app.id.clone(), app.clone());
        }
        Ok(Self { by_key, by_id })
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<Application>> {
        self.by_id.values()
    }

    pub fn find_by_key(&self, key: &str) -> Result<Arc<Application>> {
        self.by_key
            .get(key)
            .cloned()
            .ok_or_else(|| Error::UnknownApplication(key.to_string()))
    }

    pub fn find_by_id(&self, id: &str) -> Result<Arc<Application>> {
        self.by_id
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownApplication(id.to_string()))
    }
}
