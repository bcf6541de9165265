pub mod enhance;
pub mod settings;
pub mod types;

use anyhow::{Context, Result};
use std::path::Path;

pub use settings::{ServerEntry, Settings, SettingsSnapshot};
pub use types::{Config, InvocationMode, LogConfig, MiscConfig, TeardownOrder, TunnelConfig};

pub fn load_config(path: &str) -> Result<Config> {
    let content = load_config_content(path)?;
    let config = parse_config(&content)?;
    tracing::debug!(path, "config loaded");
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = serde_yml::from_str(content).context("invalid config document")?;
    config.validate()?;
    Ok(config)
}

pub fn load_config_content(path: &str) -> Result<String> {
    let raw = std::fs::read_to_string(Path::new(path))
        .with_context(|| format!("failed to read config '{}'", path))?;
    Ok(enhance::expand_env_vars(&raw))
}
