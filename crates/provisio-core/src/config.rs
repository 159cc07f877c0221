//! Runtime configuration.
//!
//! Resolution order: built-in defaults, then an optional JSON file, then
//! `PROVISIO_*` environment variables. CLI flags are applied last by the
//! binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use provisio_plugin::{ControllerOptions, PluginResolver};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::builtin::BUILTIN_DRIVERS;
use crate::sequencer::SequencerOptions;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioConfig {
    /// Directory holding `plugins/<name>/<version>/plugin`.
    pub plugin_root: PathBuf,
    /// Driver names served by the provisio binary itself.
    pub builtin_drivers: Vec<String>,
    pub handshake_timeout_secs: u64,
    pub dial_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub shutdown_grace_ms: u64,
    pub health_attempts: u32,
    pub health_interval_secs: u64,
    pub health_call_timeout_secs: u64,
}

impl Default for ProvisioConfig {
    fn default() -> Self {
        Self {
            plugin_root: PathBuf::from("."),
            builtin_drivers: BUILTIN_DRIVERS
                .iter()
                .map(|(name, _)| name.to_string())
                .collect(),
            handshake_timeout_secs: 10,
            dial_timeout_secs: 3,
            connect_timeout_secs: 10,
            shutdown_grace_ms: 1000,
            health_attempts: 10,
            health_interval_secs: 3,
            health_call_timeout_secs: 30,
        }
    }
}

impl ProvisioConfig {
    /// Defaults, overlaid with `path` (if given) and the process environment.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `PROVISIO_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup("PROVISIO_PLUGIN_ROOT") {
            self.plugin_root = PathBuf::from(root);
        }
        if let Some(list) = lookup("PROVISIO_BUILTIN_DRIVERS") {
            self.builtin_drivers = list
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect();
        }
        override_num(&lookup, "PROVISIO_HANDSHAKE_TIMEOUT_SECS", &mut self.handshake_timeout_secs)?;
        override_num(&lookup, "PROVISIO_DIAL_TIMEOUT_SECS", &mut self.dial_timeout_secs)?;
        override_num(&lookup, "PROVISIO_CONNECT_TIMEOUT_SECS", &mut self.connect_timeout_secs)?;
        override_num(&lookup, "PROVISIO_SHUTDOWN_GRACE_MS", &mut self.shutdown_grace_ms)?;
        override_num(&lookup, "PROVISIO_HEALTH_ATTEMPTS", &mut self.health_attempts)?;
        override_num(&lookup, "PROVISIO_HEALTH_INTERVAL_SECS", &mut self.health_interval_secs)?;
        override_num(
            &lookup,
            "PROVISIO_HEALTH_CALL_TIMEOUT_SECS",
            &mut self.health_call_timeout_secs,
        )?;
        Ok(())
    }

    pub fn resolver(&self) -> PluginResolver {
        PluginResolver::new(&self.plugin_root).with_builtin(self.builtin_drivers.iter().cloned())
    }

    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            discovery_timeout: Duration::from_secs(self.handshake_timeout_secs),
            dial_timeout: Duration::from_secs(self.dial_timeout_secs),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
        }
    }

    pub fn sequencer_options(&self) -> SequencerOptions {
        SequencerOptions {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            health_attempts: self.health_attempts.max(1),
            health_interval: Duration::from_secs(self.health_interval_secs),
            health_call_timeout: Duration::from_secs(self.health_call_timeout_secs),
            exit_timeout: Duration::from_millis(self.shutdown_grace_ms),
        }
    }
}

fn override_num<F, T>(lookup: &F, key: &str, slot: &mut T) -> ConfigResult<()>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(raw) = lookup(key) {
        *slot = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.clone(),
        })?;
    }
    Ok(())
}
