// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::connector::ProxyError;
use crate::discoverer::DiscoveryError;
use crate::error::ErrorKind;
use crate::option::{keys, Fixed, Options, Value};
use crate::picker::PickerError;

const DEFAULT_CONF_GLOB: &str = "conf/servicer/*.toml";
const DEFAULT_LOCALITY: &str = "default";
const DEFAULT_RETRY_INTERVAL_MS: u64 = 5000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse service config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("service config has no Name")]
    MissingName,
    #[error("invalid {section} section: {reason}")]
    InvalidSection {
        section: &'static str,
        reason: String,
    },
    #[error("Resource must declare exactly one discoverer, found {0}")]
    ResourceCount(usize),
    #[error("config hook {name:?}: {reason}")]
    Hook { name: String, reason: String },
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error(transparent)]
    Picker(#[from] PickerError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error("invalid setting {name}: {reason}")]
    InvalidSetting { name: &'static str, reason: String },
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConfigError::Picker(e) => e.kind(),
            ConfigError::Discovery(e) => e.kind(),
            _ => ErrorKind::ConfigError,
        }
    }
}

/// Process-wide settings, read from `RAL_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteAccessConfig {
    /// Glob of service files to load.
    pub conf_glob: String,
    /// Locality used by static discovery.
    pub locality: String,
    /// Retry failed starts in the background instead of failing the load.
    pub allow_start_fail: bool,
    pub retry_interval: Duration,
    pub connect_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub retry: Option<u64>,
    pub log_level: String,
}

impl Default for RemoteAccessConfig {
    fn default() -> Self {
        Self {
            conf_glob: DEFAULT_CONF_GLOB.to_string(),
            locality: DEFAULT_LOCALITY.to_string(),
            allow_start_fail: true,
            retry_interval: Duration::from_millis(DEFAULT_RETRY_INTERVAL_MS),
            connect_timeout: None,
            read_timeout: None,
            write_timeout: None,
            retry: None,
            log_level: "info".to_string(),
        }
    }
}

fn parse_u64(name: &'static str) -> Result<Option<u64>, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidSetting {
                name,
                reason: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

impl RemoteAccessConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            conf_glob: env::var("RAL_CONF_GLOB").unwrap_or(defaults.conf_glob),
            locality: env::var("RAL_LOCALITY").unwrap_or(defaults.locality),
            allow_start_fail: env::var("RAL_ALLOW_START_FAIL")
                .map(|v| v.to_lowercase() != "false")
                .unwrap_or(defaults.allow_start_fail),
            retry_interval: parse_u64("RAL_RETRY_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_interval),
            connect_timeout: parse_u64("RAL_CONNECT_TIMEOUT_MS")?.map(Duration::from_millis),
            read_timeout: parse_u64("RAL_READ_TIMEOUT_MS")?.map(Duration::from_millis),
            write_timeout: parse_u64("RAL_WRITE_TIMEOUT_MS")?.map(Duration::from_millis),
            retry: parse_u64("RAL_RETRY")?,
            log_level: env::var("RAL_LOG_LEVEL")
                .map(|v| v.to_lowercase())
                .unwrap_or(defaults.log_level),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.conf_glob.trim().is_empty() {
            return Err(ConfigError::InvalidSetting {
                name: "RAL_CONF_GLOB",
                reason: "cannot be empty".to_string(),
            });
        }
        if self.locality.trim().is_empty() {
            return Err(ConfigError::InvalidSetting {
                name: "RAL_LOCALITY",
                reason: "cannot be empty".to_string(),
            });
        }
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::InvalidSetting {
                name: "RAL_LOG_LEVEL",
                reason: format!(
                    "{:?} is not one of trace, debug, info, warn, error",
                    self.log_level
                ),
            });
        }
        Ok(())
    }

    /// The lowest option scope shared by every service.
    pub fn process_defaults(&self) -> Options {
        let mut layer = Vec::new();
        if let Some(d) = self.connect_timeout {
            layer.push((keys::CONN_TIMEOUT, Value::Duration(d)));
        }
        if let Some(d) = self.read_timeout {
            layer.push((keys::READ_TIMEOUT, Value::Duration(d)));
        }
        if let Some(d) = self.write_timeout {
            layer.push((keys::WRITE_TIMEOUT, Value::Duration(d)));
        }
        if let Some(r) = self.retry {
            layer.push((keys::RETRY, Value::UInt(r)));
        }
        Options::new(Arc::new(layer.into_iter().collect::<Fixed>()))
    }
}
