// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::config::{ConfigHooks, ServicerConfig};
use super::reload::ConfigReloader;
use super::DefaultServicer;
use crate::config::{ConfigError, RemoteAccessConfig};
use crate::connector::{Connector, DefaultConnector, Dialer, TcpDialer};
use crate::discoverer::DiscovererRegistry;
use crate::option::{keys, Options};
use crate::picker::PickerRegistry;
use crate::pool::KeyedPool;

const DEFAULT_MAX_IDLE_PER_ADDRESS: u64 = 2;
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Everything needed to turn a service file into a [`DefaultServicer`].
///
/// Holds the strategy and discoverer registries, config hooks and the
/// process-default option scope. One instance is shared by every loader.
#[derive(Clone)]
pub struct ServicerFactory {
    pickers: PickerRegistry,
    discoverers: DiscovererRegistry,
    hooks: ConfigHooks,
    locality: String,
    defaults: Options,
    dialer: Arc<dyn Dialer>,
}

impl Default for ServicerFactory {
    fn default() -> Self {
        Self {
            pickers: PickerRegistry::builtin(),
            discoverers: DiscovererRegistry::builtin(),
            hooks: ConfigHooks::new(),
            locality: "default".to_string(),
            defaults: Options::empty(),
            dialer: Arc::new(TcpDialer),
        }
    }
}

impl ServicerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &RemoteAccessConfig) -> Self {
        Self::new()
            .with_locality(config.locality.clone())
            .with_defaults(config.process_defaults())
    }

    pub fn with_locality(mut self, locality: impl Into<String>) -> Self {
        self.locality = locality.into();
        self
    }

    pub fn with_defaults(mut self, defaults: Options) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    pub fn pickers_mut(&mut self) -> &mut PickerRegistry {
        &mut self.pickers
    }

    pub fn discoverers_mut(&mut self) -> &mut DiscovererRegistry {
        &mut self.discoverers
    }

    pub fn hooks_mut(&mut self) -> &mut ConfigHooks {
        &mut self.hooks
    }

    pub fn hooks(&self) -> &ConfigHooks {
        &self.hooks
    }

    pub fn defaults(&self) -> &Options {
        &self.defaults
    }

    pub fn build(&self, config: ServicerConfig) -> Result<DefaultServicer, ConfigError> {
        self.assemble(config, None)
    }

    /// Builds from a file; with `reload_interval` the servicer also picks
    /// up later edits to the file's top-level values.
    pub fn build_from_file(
        &self,
        path: &Path,
        reload_interval: Option<Duration>,
    ) -> Result<DefaultServicer, ConfigError> {
        let config = ServicerConfig::from_file(path, &self.hooks)?;
        let reloader = reload_interval
            .filter(|d| !d.is_zero())
            .map(|interval| Arc::new(ConfigReloader::new(path, interval, self.hooks.clone())));
        self.assemble(config, reloader)
    }

    fn assemble(
        &self,
        config: ServicerConfig,
        reloader: Option<Arc<ConfigReloader>>,
    ) -> Result<DefaultServicer, ConfigError> {
        let layer = Arc::new(config.layer());
        let option = self.defaults.with_front(layer.clone());

        let picker = self
            .pickers
            .build(&config.strategy.name, config.strategy.params.as_ref())?;
        let max_idle = option.uint(keys::MAX_IDLE_PER_ADDRESS, DEFAULT_MAX_IDLE_PER_ADDRESS);
        let pool = KeyedPool::new(
            usize::try_from(max_idle).unwrap_or(usize::MAX),
            option.duration_ms(keys::IDLE_TIMEOUT, DEFAULT_IDLE_TIMEOUT),
        );
        let connector = Arc::new(
            DefaultConnector::builder()
                .dialer(self.dialer.clone())
                .picker(picker)
                .pool(Arc::new(pool))
                .connect_timeout(option.connect_timeout())
                .build(),
        );
        if let Some(proxy) = config.proxy.clone() {
            match connector.as_proxy_setter() {
                Some(setter) => setter.set_proxy(proxy)?,
                None => warn!(service = %config.name, "factory: connector cannot use a proxy"),
            }
        }

        let (kind, params) = &config.resource;
        let discoverer = self.discoverers.build(kind, &self.locality, params)?;
        debug!(
            service = %config.name,
            strategy = %config.strategy.name,
            discoverer = %discoverer.describe(),
            "factory: assembled service"
        );

        let mut builder = DefaultServicer::builder(config.name)
            .connector(connector)
            .discoverer(discoverer)
            .options(layer)
            .base(self.defaults.clone());
        if let Some(reloader) = reloader {
            builder = builder.producer(reloader.clone()).worker(reloader);
        }
        Ok(builder.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::option::{Fixed, Value};
    use crate::servicer::Servicer;

    fn config(src: &str) -> ServicerConfig {
        ServicerConfig::parse(src, &ConfigHooks::new()).unwrap()
    }

    #[test]
    fn test_service_scope_overrides_process_defaults() {
        let defaults: Fixed = [
            (keys::CONN_TIMEOUT, Value::Int(900)),
            (keys::RETRY, Value::Int(3)),
        ]
        .into_iter()
        .collect();
        let factory = ServicerFactory::new().with_defaults(Options::new(Arc::new(defaults)));
        let servicer = factory
            .build(config(
                "Name = \"a\"\nConnTimeOut = 100\n[Resource.static]\ndefault = [{ Host = \"h\", Port = 1 }]\n",
            ))
            .unwrap();

        assert_eq!(servicer.option().connect_timeout(), Duration::from_millis(100));
        assert_eq!(servicer.option().retry(), 3);
        let connector = servicer.connector().unwrap();
        assert_eq!(connector.as_strategy().unwrap().strategy(), "round-robin");
    }

    #[test]
    fn test_unknown_strategy_and_discoverer() {
        let factory = ServicerFactory::new();
        let err = factory
            .build(config(
                "Name = \"a\"\n[Strategy]\nName = \"random\"\n[Resource.static]\ndefault = [{ Host = \"h\", Port = 1 }]\n",
            ))
            .err()
            .unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);

        let err = factory
            .build(config("Name = \"a\"\n[Resource.Consul]\nService = \"x\"\n"))
            .err()
            .unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[test]
    fn test_proxy_is_applied() {
        let servicer = ServicerFactory::new()
            .build(config(
                r#"
                Name = "a"
                [Resource.static]
                default = [{ Host = "h", Port = 1 }]
                [Proxy]
                Protocol = "HTTP"
                Addr = "proxy:3128"
                "#,
            ))
            .unwrap();
        let connector = servicer.connector().unwrap();
        let proxy = connector.as_proxy_setter().unwrap().proxy().unwrap();
        assert_eq!(proxy.url(), "http://proxy:3128");
    }
}
