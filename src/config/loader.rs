// Configuration loader
// Loads ~/.devicemesh/config.toml, then applies environment overrides

use super::settings::Config;
use crate::device::identity::default_dir;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Load configuration from the default location. A missing file means
/// defaults; an unreadable or invalid one is an error.
pub fn load_config() -> Result<Config> {
    let path = default_dir()?.join("config.toml");
    load_config_from(&path)
}

pub fn load_config_from(path: &Path) -> Result<Config> {
    let mut config = if path.exists() {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        toml::from_str::<Config>(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))?
    } else {
        tracing::debug!("No config at {}, using defaults", path.display());
        Config::default()
    };

    apply_env_overrides(&mut config);

    config
        .validate()
        .context("Configuration validation failed")?;

    Ok(config)
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(url) = std::env::var("DEVICEMESH_RELAY_URL") {
        if !url.is_empty() {
            config.relay.url = url;
            config.relay.enabled = true;
        }
    }
    if let Ok(workspace) = std::env::var("DEVICEMESH_WORKSPACE") {
        if !workspace.is_empty() {
            config.workspace.id = Some(workspace);
        }
    }
}
