//! Loads `revurb.toml` into a [`schema::RevurbConfig`] and turns its
//! `apps` list into the immutable [`registry::AppRegistry`] the rest of
//! the core resolves tenants through (spec §4.1, §6 Configuration).

pub mod error;
pub mod loader;
pub mod registry;
pub mod schema;

pub use error::{Error, Result};
pub use registry::{AppRegistry, Application};
pub use schema::{ApplicationConfig, BusKind, IntervalsConfig, RevurbConfig, ScalingConfig, ServerConfig};
