//! Configuration loading from the environment and TOML files.

use std::path::Path;

use anyhow::{Context, Result};
use regex_lite::Regex;
use tracing::info;

use super::SentinelConfig;

/// Environment variable naming the profile.
pub const PROFILE_ENV: &str = "SENTINEL_PROFILE";
/// Environment variable pointing at a TOML file.
pub const CONFIG_ENV: &str = "SENTINEL_CONFIG";

impl SentinelConfig {
    /// Load a TOML file, expanding `${VAR}` references first.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        Self::from_toml_str(&content).with_context(|| format!("Failed to parse {:?}", path))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let expanded = expand_env(content)?;
        let config: Self = toml::from_str(&expanded)?;
        Ok(config)
    }
}

/// Resolve the configuration for this process.
///
/// `SENTINEL_CONFIG` wins when set; otherwise the `SENTINEL_PROFILE` profile
/// (or the default) is used. The result is validated either way.
pub fn load_config() -> Result<SentinelConfig> {
    let config = match std::env::var(CONFIG_ENV) {
        Ok(path) if !path.is_empty() => {
            info!(path = %path, "Loading configuration file");
            SentinelConfig::from_file(&path)?
        }
        _ => SentinelConfig::from_env(),
    };
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Expand `${VAR_NAME}` patterns with environment variable values.
///
/// Unset variables are left in place so the parse error points at them.
pub fn expand_env(s: &str) -> Result<String> {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")?;
    let expanded = re.replace_all(s, |caps: &regex_lite::Captures<'_>| {
        std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
    });
    Ok(expanded.into_owned())
}
