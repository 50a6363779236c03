// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::connector::Connector;
use crate::logger::Field;
use crate::option::{keys, Dynamic, Options, Value};

/// Per-call overrides, the innermost option scope of a RAL call.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    values: BTreeMap<String, Value>,
    fields: Vec<Field>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect_timeout(self, timeout: Duration) -> Self {
        self.set(keys::CONN_TIMEOUT, timeout)
    }

    pub fn read_timeout(self, timeout: Duration) -> Self {
        self.set(keys::READ_TIMEOUT, timeout)
    }

    pub fn write_timeout(self, timeout: Duration) -> Self {
        self.set(keys::WRITE_TIMEOUT, timeout)
    }

    pub fn retry(self, retry: u64) -> Self {
        self.set(keys::RETRY, retry)
    }

    /// Uses `connector` instead of the service's own for this call.
    pub fn connector(self, connector: Arc<dyn Connector>) -> Self {
        self.set(keys::CONNECTOR, Value::extension(connector))
    }

    /// Extra field for the call's log lines and event.
    pub fn field(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.fields.push(Field::new(key, value));
        self
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Stacks these overrides in front of `base`.
    pub(crate) fn over(&self, base: &Options) -> Options {
        let layer = Arc::new(Dynamic::new());
        for (k, v) in &self.values {
            layer.set(k.clone(), v.clone());
        }
        base.with_front(layer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::option::Fixed;

    #[test]
    fn test_call_scope_wins() {
        let service: Fixed = [
            (keys::CONN_TIMEOUT, Value::Int(500)),
            (keys::RETRY, Value::Int(2)),
        ]
        .into_iter()
        .collect();
        let base = Options::new(Arc::new(service));
        let merged = CallOptions::new()
            .connect_timeout(Duration::from_millis(50))
            .over(&base);

        assert_eq!(merged.connect_timeout(), Duration::from_millis(50));
        assert_eq!(merged.retry(), 2);
        assert_eq!(merged.depth(), 2);
        assert_eq!(base.connect_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn test_fields_are_kept_in_order() {
        let opts = CallOptions::new().field("a", 1).field("b", "two");
        assert_eq!(
            opts.fields(),
            &[Field::new("a", 1), Field::new("b", "two")]
        );
    }
}
