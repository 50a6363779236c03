// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Service files.
//!
//! ```toml
//! Name = "user-db"
//! ConnTimeOut = 200
//!
//! [Strategy]
//! Name = "weighted-round-robin"
//! weighted-round-robin = { DefaultWeight = 2 }
//!
//! [Resource.Manual]
//! default = [{ Host = "10.0.0.1", Port = 3306 }]
//!
//! [Proxy]
//! Protocol = "SOCKS5"
//! Addr = "127.0.0.1:1080"
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::ConfigError;
use crate::connector::ProxyConfig;
use crate::option::{Fixed, Value};
use crate::picker::DEFAULT_STRATEGY;

pub type ConfigMap = BTreeMap<String, Value>;

pub type ConfigHook = Arc<dyn Fn(&mut ConfigMap) -> Result<(), String> + Send + Sync>;

struct HookEntry {
    name: String,
    priority: i32,
    hook: ConfigHook,
}

/// Transformations applied to every parsed service file, lowest priority
/// first; equal priorities keep registration order.
#[derive(Clone, Default)]
pub struct ConfigHooks {
    hooks: Vec<Arc<HookEntry>>,
}

impl fmt::Debug for ConfigHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.hooks.iter().map(|h| (&h.name, h.priority)))
            .finish()
    }
}

impl ConfigHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        priority: i32,
        hook: ConfigHook,
    ) -> Result<(), ConfigError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ConfigError::Hook {
                name,
                reason: "hook name cannot be empty".to_string(),
            });
        }
        if self.hooks.iter().any(|h| h.name == name) {
            return Err(ConfigError::Hook {
                name,
                reason: "already registered".to_string(),
            });
        }
        let at = self.hooks.partition_point(|h| h.priority <= priority);
        self.hooks.insert(
            at,
            Arc::new(HookEntry {
                name,
                priority,
                hook,
            }),
        );
        Ok(())
    }

    pub fn names(&self) -> Vec<&str> {
        self.hooks.iter().map(|h| h.name.as_str()).collect()
    }

    pub fn apply(&self, map: &mut ConfigMap) -> Result<(), ConfigError> {
        for entry in &self.hooks {
            (entry.hook)(map).map_err(|reason| ConfigError::Hook {
                name: entry.name.clone(),
                reason,
            })?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StrategyConfig {
    pub name: String,
    pub params: Option<toml::Value>,
}

#[derive(Debug, Clone)]
pub struct ServicerConfig {
    pub name: String,
    pub strategy: StrategyConfig,
    /// Discoverer kind and its parameters.
    pub resource: (String, toml::Value),
    pub proxy: Option<ProxyConfig>,
    /// Every top-level key after the hooks ran.
    pub values: ConfigMap,
    pub source: Option<PathBuf>,
}

fn section<'a>(
    table: &'a toml::Table,
    key: &'static str,
) -> Result<Option<&'a toml::Table>, ConfigError> {
    match table.get(key) {
        None => Ok(None),
        Some(toml::Value::Table(t)) => Ok(Some(t)),
        Some(other) => Err(ConfigError::InvalidSection {
            section: key,
            reason: format!("expected a table, found {}", other.type_str()),
        }),
    }
}

impl ServicerConfig {
    pub fn parse(src: &str, hooks: &ConfigHooks) -> Result<Self, ConfigError> {
        let table: toml::Table = src.parse()?;

        let name = table
            .get("Name")
            .and_then(toml::Value::as_str)
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or(ConfigError::MissingName)?
            .to_string();

        let strategy = match section(&table, "Strategy")? {
            Some(t) => {
                let name = match t.get("Name") {
                    None => DEFAULT_STRATEGY.to_string(),
                    Some(v) => v
                        .as_str()
                        .filter(|n| !n.is_empty())
                        .ok_or_else(|| ConfigError::InvalidSection {
                            section: "Strategy",
                            reason: "Name must be a non-empty string".to_string(),
                        })?
                        .to_string(),
                };
                let params = t.get(&name).cloned();
                StrategyConfig { name, params }
            }
            None => StrategyConfig {
                name: DEFAULT_STRATEGY.to_string(),
                params: None,
            },
        };

        let resource = section(&table, "Resource")?.ok_or(ConfigError::ResourceCount(0))?;
        if resource.len() != 1 {
            return Err(ConfigError::ResourceCount(resource.len()));
        }
        let resource = resource
            .iter()
            .next()
            .map(|(k, v)| (k.clone(), v.clone()))
            .ok_or(ConfigError::ResourceCount(0))?;

        let proxy = table
            .get("Proxy")
            .map(ProxyConfig::from_raw)
            .transpose()?;

        let mut values: ConfigMap = table
            .into_iter()
            .map(|(k, v)| (k, Value::from(v)))
            .collect();
        hooks.apply(&mut values)?;

        Ok(Self {
            name,
            strategy,
            resource,
            proxy,
            values,
            source: None,
        })
    }

    pub fn from_file(path: &Path, hooks: &ConfigHooks) -> Result<Self, ConfigError> {
        let src = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::parse(&src, hooks)?;
        config.source = Some(path.to_path_buf());
        Ok(config)
    }

    /// The frozen service option layer.
    pub fn layer(&self) -> Fixed {
        Fixed::new(self.values.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::option::{keys, Layer};

    const FULL: &str = r#"
        Name = "user-db"
        ConnTimeOut = 200

        [Strategy]
        Name = "weighted-round-robin"
        weighted-round-robin = { DefaultWeight = 2 }

        [Resource.Manual]
        default = [{ Host = "10.0.0.1", Port = 3306 }]

        [Proxy]
        Protocol = "socks5"
        Addr = "127.0.0.1:1080"
    "#;

    #[test]
    fn test_parse_full_file() {
        let cfg = ServicerConfig::parse(FULL, &ConfigHooks::new()).unwrap();
        assert_eq!(cfg.name, "user-db");
        assert_eq!(cfg.strategy.name, "weighted-round-robin");
        assert!(cfg.strategy.params.is_some());
        assert_eq!(cfg.resource.0, "Manual");
        assert!(cfg.proxy.is_some());
        assert_eq!(
            cfg.layer().get(keys::CONN_TIMEOUT).and_then(|v| v.as_i64()),
            Some(200)
        );
    }

    #[test]
    fn test_strategy_defaults_to_round_robin() {
        let cfg = ServicerConfig::parse(
            "Name = \"a\"\n[Resource.static]\ndefault = []\n",
            &ConfigHooks::new(),
        )
        .unwrap();
        assert_eq!(cfg.strategy.name, DEFAULT_STRATEGY);
        assert_eq!(cfg.strategy.params, None);
    }

    #[test]
    fn test_missing_name() {
        let err = ServicerConfig::parse("[Resource.static]\n", &ConfigHooks::new()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingName));
        let err = ServicerConfig::parse("Name = \"  \"\n", &ConfigHooks::new()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingName));
    }

    #[test]
    fn test_resource_needs_exactly_one_key() {
        let none = ServicerConfig::parse("Name = \"a\"\n", &ConfigHooks::new()).unwrap_err();
        assert!(matches!(none, ConfigError::ResourceCount(0)));
        let two = ServicerConfig::parse(
            "Name = \"a\"\n[Resource.static]\n[Resource.Consul]\n",
            &ConfigHooks::new(),
        )
        .unwrap_err();
        assert!(matches!(two, ConfigError::ResourceCount(2)));
    }

    #[test]
    fn test_hooks_run_by_priority_then_registration() {
        let mut hooks = ConfigHooks::new();
        let append = |tag: &'static str| -> ConfigHook {
            Arc::new(move |map: &mut ConfigMap| -> Result<(), String> {
                let trail = map
                    .get("Trail")
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default();
                map.insert("Trail".to_string(), Value::from(format!("{trail}{tag}")));
                Ok(())
            })
        };
        hooks.register("late", 10, append("c")).unwrap();
        hooks.register("early", -1, append("a")).unwrap();
        hooks.register("same-priority", 10, append("d")).unwrap();
        hooks.register("middle", 0, append("b")).unwrap();
        assert_eq!(hooks.names(), vec!["early", "middle", "late", "same-priority"]);

        let cfg = ServicerConfig::parse(FULL, &hooks).unwrap();
        assert_eq!(cfg.values["Trail"].as_str(), Some("abcd"));
    }

    #[test]
    fn test_hook_registration_errors() {
        let noop: ConfigHook = Arc::new(|_: &mut ConfigMap| -> Result<(), String> { Ok(()) });
        let mut hooks = ConfigHooks::new();
        assert!(matches!(
            hooks.register("", 0, noop.clone()),
            Err(ConfigError::Hook { .. })
        ));
        hooks.register("x", 0, noop.clone()).unwrap();
        assert!(matches!(
            hooks.register("x", 1, noop),
            Err(ConfigError::Hook { .. })
        ));
    }

    #[test]
    fn test_hook_failure_aborts_parse() {
        let mut hooks = ConfigHooks::new();
        hooks
            .register(
                "deny",
                0,
                Arc::new(|_: &mut ConfigMap| -> Result<(), String> {
                    Err("forbidden".to_string())
                }),
            )
            .unwrap();
        let err = ServicerConfig::parse(FULL, &hooks).unwrap_err();
        assert_eq!(err.to_string(), "config hook \"deny\": forbidden");
    }
}
