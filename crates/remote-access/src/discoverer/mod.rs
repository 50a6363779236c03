// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Resolving a service's live address set.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::Context;
use crate::error::ErrorKind;
use crate::messager::{Consumer, Message, Producer};
use crate::worker::Worker;

mod static_table;

pub use static_table::StaticDiscoverer;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("unknown discoverer kind {0:?}")]
    UnknownKind(String),
    #[error("discoverer kind {0:?} is already registered")]
    Duplicate(String),
    #[error("invalid discovery config: {0}")]
    Config(String),
    #[error("discovery failed: {0}")]
    Source(String),
}

impl DiscoveryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DiscoveryError::UnknownKind(_) => ErrorKind::NotFound,
            DiscoveryError::Duplicate(_) => ErrorKind::Duplicate,
            DiscoveryError::Config(_) => ErrorKind::ConfigError,
            DiscoveryError::Source(_) => ErrorKind::Other,
        }
    }
}

#[async_trait]
pub trait Discoverer: Send + Sync {
    /// Current resource data, typically one address-update message.
    async fn discover(&self, ctx: &Context) -> Result<Vec<Message>, DiscoveryError>;

    fn describe(&self) -> String;

    fn as_producer(&self) -> Option<&dyn Producer> {
        None
    }

    fn as_consumer(self: Arc<Self>) -> Option<Arc<dyn Consumer>> {
        None
    }

    fn as_worker(&self) -> Option<&dyn Worker> {
        None
    }
}

/// Builds a discoverer for `locality` from the `Resource.<kind>` section.
pub type DiscovererFactory = Arc<
    dyn Fn(&str, &toml::Value) -> Result<Arc<dyn Discoverer>, DiscoveryError> + Send + Sync,
>;

#[derive(Clone, Default)]
pub struct DiscovererRegistry {
    factories: HashMap<String, DiscovererFactory>,
}

impl fmt::Debug for DiscovererRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<&String> = self.factories.keys().collect();
        kinds.sort();
        f.debug_struct("DiscovererRegistry")
            .field("kinds", &kinds)
            .finish()
    }
}

impl DiscovererRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut registry = Self::new();
        let static_table: DiscovererFactory =
            Arc::new(|locality: &str, params: &toml::Value| {
                StaticDiscoverer::from_params(locality, params)
                    .map(|d| Arc::new(d) as Arc<dyn Discoverer>)
            });
        let _ = registry.register("static", static_table.clone());
        let _ = registry.register("Manual", static_table);
        registry
    }

    pub fn register(
        &mut self,
        kind: impl Into<String>,
        factory: DiscovererFactory,
    ) -> Result<(), DiscoveryError> {
        let kind = kind.into();
        if self.factories.contains_key(&kind) {
            return Err(DiscoveryError::Duplicate(kind));
        }
        self.factories.insert(kind, factory);
        Ok(())
    }

    pub fn build(
        &self,
        kind: &str,
        locality: &str,
        params: &toml::Value,
    ) -> Result<Arc<dyn Discoverer>, DiscoveryError> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| DiscoveryError::UnknownKind(kind.to_string()))?;
        factory(locality, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_kind() {
        let err = DiscovererRegistry::builtin()
            .build("Consul", "east", &toml::Value::Table(Default::default()))
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_manual_alias() {
        let params: toml::Value =
            toml::Value::Table(r#"east = [{ Host = "10.0.0.1", Port = 80 }]"#.parse().unwrap());
        let registry = DiscovererRegistry::builtin();
        assert!(registry.build("Manual", "east", &params).is_ok());
        assert!(registry.build("static", "east", &params).is_ok());
    }
}
