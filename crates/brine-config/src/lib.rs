//! Master and minion configuration.
//!
//! Both files are YAML. Every key is optional; missing keys take the
//! documented defaults. Interactions between keys are normalised by
//! `validate()`, which the loaders call before returning.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use thiserror::Error;

mod enums;
mod master;
mod minion;

pub use brine_crypto::HashType;
pub use enums::*;
pub use master::{MasterConfig, PublisherAclBlacklist};
pub use minion::{MasterSetting, MinionConfig};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),
    #[error("Failed to read config: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub(crate) fn load_yaml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ConfigError::NotFound(path.display().to_string())
        } else {
            ConfigError::Read(e)
        }
    })?;
    parse_yaml(&contents)
}

pub(crate) fn parse_yaml<T: DeserializeOwned>(contents: &str) -> Result<T, ConfigError> {
    // An empty file is a valid config that keeps every default.
    if contents.trim().is_empty() {
        return Ok(serde_yaml::from_str("{}")?);
    }
    Ok(serde_yaml::from_str(contents)?)
}

/// Accept either `key: value` or `key: [value, ...]`.
pub(crate) fn string_or_list<'de, D>(d: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match OneOrMany::deserialize(d)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

/// Map a configured `log_level` onto a tracing filter directive.
pub fn log_directive(level: &str) -> &'static str {
    match level.to_ascii_lowercase().as_str() {
        "all" | "garbage" | "trace" => "trace",
        "debug" | "profile" => "debug",
        "info" => "info",
        "error" | "critical" => "error",
        "quiet" => "off",
        _ => "warn",
    }
}
