//! Discovery and parsing of `revurb.toml` (spec §6 Configuration, §10.3).
//!
//! Search order: an explicit path, `./revurb.toml`, then
//! `$XDG_CONFIG_HOME/revurb/revurb.toml`. `REVURB_BIND`/`REVURB_PORT`
//! override `server.bind`/`server.port` after parsing; `REVURB_CONFIG_DIR`
//! overrides the user-global search directory.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{
    error::{Error, Result},
    schema::{BusKind, RevurbConfig},
};

const CONFIG_FILENAME: &str = "revurb.toml";

/// Load and validate config from an explicit path, or discover one from
/// the standard locations. Falls back to `RevurbConfig::default()` (no
/// applications configured) if nothing is found on disk.
pub fn load(explicit_path: Option<&Path>) -> Result<RevurbConfig> {
    let config = match explicit_path {
        Some(path) => load_from_path(path)?,
        None => match find_config_file() {
            Some(path) => {
                debug!(path = %path.display(), "loading config");
                load_from_path(&path)?
            },
            None => {
                debug!("no config file found, using defaults");
                RevurbConfig::default()
            },
        },
    };
    let config = apply_env_overrides(config);
    validate(&config)?;
    Ok(config)
}

fn load_from_path(path: &Path) -> Result<RevurbConfig> {
    let raw = std::fs::read_to_string(path)?;
    toml::from_str(&raw).map_err(|source| Error::Toml {
        path: path.display().to_string(),
        source,
    })
}

fn apply_env_overrides(mut config: RevurbConfig) -> RevurbConfig {
    if let Ok(bind) = std::env::var("REVURB_BIND") {
        config.server.bind = bind;
    }
    if let Ok(port) = std::env::var("REVURB_PORT")
        && let Ok(port) = port.parse()
    {
        config.server.port = port;
    }
    config
}

/// Rejects configuration combinations that would be silently wrong at
/// steady state (spec §7: configuration errors are fatal at startup,
/// never raised later).
fn validate(config: &RevurbConfig) -> Result<()> {
    if config.scaling.enabled && config.scaling.bus == BusKind::Local {
        return Err(Error::Invalid(
            "scaling.enabled requires scaling.bus != \"local\" — a local bus is a single-node \
             no-op and cannot honestly advertise fleet-wide fan-out"
                .to_string(),
        ));
    }
    if config.scaling.enabled && config.scaling.url.is_none() {
        return Err(Error::Invalid(
            "scaling.enabled requires scaling.url to be set".to_string(),
        ));
    }
    Ok(())
}

fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from(CONFIG_FILENAME);
    if local.exists() {
        return Some(local);
    }
    let config_dir = config_dir()?;
    let candidate = config_dir.join(CONFIG_FILENAME);
    candidate.exists().then_some(candidate)
}

/// The user-global config directory: `$REVURB_CONFIG_DIR` if set,
/// otherwise `directories::ProjectDirs`' platform-appropriate config dir.
pub fn config_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("REVURB_CONFIG_DIR") {
        return Some(PathBuf::from(dir));
    }
    directories::ProjectDirs::from("", "", "revurb").map(|d| d.config_dir().to_path_buf())
}
