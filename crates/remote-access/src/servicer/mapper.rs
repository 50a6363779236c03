// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{info, warn};

use super::Servicer;
use crate::error::ErrorKind;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MapperError {
    #[error("service {0:?} is already registered")]
    Duplicate(String),
}

impl MapperError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Duplicate
    }
}

/// Name to [`Servicer`] registry shared by loaders and callers.
#[derive(Default)]
pub struct Mapper {
    services: RwLock<HashMap<String, Arc<dyn Servicer>>>,
}

impl Mapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `servicer` under its name; an existing entry is kept.
    pub fn add(&self, servicer: Arc<dyn Servicer>) -> Result<(), MapperError> {
        let name = servicer.name().to_string();
        let mut services = self.services.write().unwrap_or_else(|e| e.into_inner());
        if services.contains_key(&name) {
            warn!(service = %name, "mapper: duplicate service ignored");
            return Err(MapperError::Duplicate(name));
        }
        services.insert(name, servicer);
        Ok(())
    }

    /// Inserts or replaces, returning the previous entry.
    pub fn set(&self, servicer: Arc<dyn Servicer>) -> Option<Arc<dyn Servicer>> {
        let name = servicer.name().to_string();
        let previous = self
            .services
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.clone(), servicer);
        if previous.is_some() {
            info!(service = %name, "mapper: service replaced");
        }
        previous
    }

    pub fn pop(&self, name: &str) -> Option<Arc<dyn Servicer>> {
        self.services
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Servicer>> {
        self.services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Sorted service names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.services.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visits a snapshot of the entries in name order and stops at the
    /// first error. `f` may call back into the mapper.
    pub fn range<E>(
        &self,
        mut f: impl FnMut(&str, &Arc<dyn Servicer>) -> Result<(), E>,
    ) -> Result<(), E> {
        let mut entries: Vec<(String, Arc<dyn Servicer>)> = self
            .services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, servicer) in &entries {
            f(name, servicer)?;
        }
        Ok(())
    }

    /// Removes and stops every service. Stop errors are logged.
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<dyn Servicer>> = self
            .services
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, v)| v)
            .collect();
        for servicer in drained {
            if let Err(e) = servicer.stop().await {
                warn!(service = %servicer.name(), error = %e, "mapper: stop failed during shutdown");
            }
        }
    }
}
