// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Load-balancing strategies.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::address::Address;
use crate::conn::ConnTracer;
use crate::context::Context;
use crate::error::ErrorKind;
use crate::messager::Consumer;

mod round_robin;
mod weighted;

pub use round_robin::RoundRobin;
pub use weighted::WeightedRoundRobin;

pub const DEFAULT_STRATEGY: &str = "round-robin";

#[derive(Debug, thiserror::Error)]
pub enum PickerError {
    #[error("no address available")]
    NoAddress,
    #[error("unknown load balancing strategy {0:?}")]
    UnknownStrategy(String),
    #[error("strategy {0:?} is already registered")]
    Duplicate(String),
    #[error("invalid parameters for strategy {strategy:?}: {reason}")]
    InvalidParams { strategy: String, reason: String },
}

impl PickerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PickerError::NoAddress => ErrorKind::Unconfigured,
            PickerError::UnknownStrategy(_) => ErrorKind::NotFound,
            PickerError::Duplicate(_) => ErrorKind::Duplicate,
            PickerError::InvalidParams { .. } => ErrorKind::ConfigError,
        }
    }
}

/// Selects one address out of a live set.
pub trait AddressPicker: Send + Sync {
    /// Strategy name, reported as the `balance` log field.
    fn name(&self) -> &str;

    /// Atomically replaces the live set.
    fn set_addresses(&self, addrs: Vec<Address>) -> Result<(), PickerError>;

    fn pick(&self, ctx: &Context) -> Result<Address, PickerError>;

    fn addresses(&self) -> Vec<Address>;

    fn as_consumer(self: Arc<Self>) -> Option<Arc<dyn Consumer>> {
        None
    }

    fn conn_tracer(&self) -> Option<Arc<dyn ConnTracer>> {
        None
    }
}

/// Builds a picker from its optional `Strategy.<name>` parameter table.
pub type PickerFactory =
    Arc<dyn Fn(Option<&toml::Value>) -> Result<Arc<dyn AddressPicker>, PickerError> + Send + Sync>;

/// Strategy name to factory table.
#[derive(Clone, Default)]
pub struct PickerRegistry {
    factories: HashMap<String, PickerFactory>,
}

impl fmt::Debug for PickerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("PickerRegistry")
            .field("strategies", &names)
            .finish()
    }
}

impl PickerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in strategies.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        let round_robin: PickerFactory = Arc::new(|_: Option<&toml::Value>| -> Result<_, PickerError> {
            Ok(Arc::new(RoundRobin::new()) as Arc<dyn AddressPicker>)
        });
        let weighted: PickerFactory = Arc::new(|params: Option<&toml::Value>| {
            WeightedRoundRobin::from_params(params).map(|p| Arc::new(p) as Arc<dyn AddressPicker>)
        });
        // Fresh registry, names cannot collide.
        let _ = registry.register(round_robin::NAME, round_robin.clone());
        let _ = registry.register("RoundRobin", round_robin);
        let _ = registry.register(weighted::NAME, weighted.clone());
        let _ = registry.register("WeightedRoundRobin", weighted);
        registry
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: PickerFactory,
    ) -> Result<(), PickerError> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(PickerError::Duplicate(name));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    pub fn build(
        &self,
        name: &str,
        params: Option<&toml::Value>,
    ) -> Result<Arc<dyn AddressPicker>, PickerError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| PickerError::UnknownStrategy(name.to_string()))?;
        factory(params)
    }
}
