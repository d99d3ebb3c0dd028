//! Config file loading and environment overrides.

use std::fs;
use std::path::Path;

use thiserror::Error;

use super::{Config, ConfigLayer};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Loads the engine config, layering the file (when present) over the
/// defaults and the environment over the file.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let mut config = Config::default();
    if let Some(path) = path
        && let Some(layer) = load_layer(path)?
    {
        layer.apply_to(&mut config);
    }
    apply_env_overrides(&mut config);
    Ok(config)
}

fn load_layer(path: &Path) -> Result<Option<ConfigLayer>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    toml::from_str(&contents)
        .map(Some)
        .map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
}

pub fn apply_env_overrides(config: &mut Config) {
    let vars: Vec<(String, String)> = std::env::vars()
        .filter(|(name, _)| name.starts_with("CHUNKREPL_"))
        .collect();
    apply_env_pairs(config, &vars);
}

fn apply_env_pairs(config: &mut Config, vars: &[(String, String)]) {
    for (name, raw) in vars {
        let value = raw.trim();
        if value.is_empty() {
            continue;
        }
        match name.as_str() {
            "CHUNKREPL_USE_CONNECTION_POOL" => {
                config.replicator.use_connection_pool = value != "0";
            }
            "CHUNKREPL_READ_SKIP_DISK_VERIFY" => {
                config.replicator.read_skip_disk_verify = value != "0";
            }
            "CHUNKREPL_MAX_RECOVERY_THREADS" => match value.parse() {
                Ok(threads) => config.rs_reader.max_recovery_threads = threads,
                Err(err) => {
                    tracing::warn!("invalid {name}, ignoring: {err}");
                }
            },
            _ => {}
        }
    }
}
