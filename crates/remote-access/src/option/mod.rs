// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Layered configuration lookup.
//!
//! An [`Options`] is an explicit front-to-back list of layers. Lookups walk
//! the list and stop at the first layer defining the key, so the front layer
//! (call scope) outranks everything behind it (session, service, process
//! defaults). Each layer is owned by the scope that created it; stacking a
//! new scope only clones the `Arc`s of the layers behind it.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

mod updater;

pub use updater::{option_message, options_from_message, OptionUpdater};

/// Well-known option keys.
pub mod keys {
    /// Connect timeout, milliseconds.
    pub const CONN_TIMEOUT: &str = "ConnTimeOut";
    /// Read timeout, milliseconds.
    pub const READ_TIMEOUT: &str = "ReadTimeOut";
    /// Write timeout, milliseconds.
    pub const WRITE_TIMEOUT: &str = "WriteTimeOut";
    pub const RETRY: &str = "Retry";
    /// Per-call override connector, stored as an extension.
    pub const CONNECTOR: &str = "Ral-Connector";
    pub const MAX_IDLE_PER_ADDRESS: &str = "MaxIdlePerAddress";
    /// Pooled connection idle limit, milliseconds.
    pub const IDLE_TIMEOUT: &str = "IdleTimeOut";
}

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub enum Value {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Duration(Duration),
    /// Tables, arrays and dates kept verbatim from the config file.
    Raw(toml::Value),
    /// Arbitrary typed objects, e.g. an override connector or a section
    /// parsed by a config hook.
    Extension(Arc<dyn Any + Send + Sync>),
}

impl Value {
    pub fn extension<T: Any + Send + Sync>(value: T) -> Self {
        Value::Extension(Arc::new(value))
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::UInt(u) => i64::try_from(*u).ok(),
            Value::Raw(toml::Value::Integer(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Int(i) => u64::try_from(*i).ok(),
            Value::UInt(u) => Some(*u),
            Value::Raw(toml::Value::Integer(i)) => u64::try_from(*i).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            Value::Raw(toml::Value::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Raw(toml::Value::Boolean(b)) => Some(*b),
            _ => None,
        }
    }

    /// Integers are read as milliseconds.
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Value::Duration(d) => Some(*d),
            Value::Float(f) => Duration::try_from_secs_f64(f / 1000.0).ok(),
            other => other.as_u64().map(Duration::from_millis),
        }
    }

    pub fn as_raw(&self) -> Option<&toml::Value> {
        match self {
            Value::Raw(raw) => Some(raw),
            _ => None,
        }
    }

    /// Safe downcast of an extension value.
    pub fn downcast<T: Any + Clone>(&self) -> Option<T> {
        match self {
            Value::Extension(ext) => ext.downcast_ref::<T>().cloned(),
            _ => None,
        }
    }

    pub fn variant_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::UInt(_) => "uint",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Duration(_) => "duration",
            Value::Raw(_) => "raw",
            Value::Extension(_) => "extension",
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Int(i) => write!(f, "Int({i})"),
            Value::UInt(u) => write!(f, "UInt({u})"),
            Value::Float(x) => write!(f, "Float({x})"),
            Value::String(s) => write!(f, "String({s:?})"),
            Value::Duration(d) => write!(f, "Duration({d:?})"),
            Value::Raw(raw) => write!(f, "Raw({raw})"),
            Value::Extension(_) => f.write_str("Extension(..)"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::UInt(a), Value::UInt(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Duration(a), Value::Duration(b)) => a == b,
            (Value::Raw(a), Value::Raw(b)) => a == b,
            (Value::Extension(a), Value::Extension(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::UInt(u64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Duration> for Value {
    fn from(v: Duration) -> Self {
        Value::Duration(v)
    }
}

impl From<toml::Value> for Value {
    fn from(v: toml::Value) -> Self {
        match v {
            toml::Value::Boolean(b) => Value::Bool(b),
            toml::Value::Integer(i) => Value::Int(i),
            toml::Value::Float(x) => Value::Float(x),
            toml::Value::String(s) => Value::String(s),
            other => Value::Raw(other),
        }
    }
}

/// One scope of key/value pairs.
pub trait Layer: Send + Sync + fmt::Debug {
    fn get(&self, key: &str) -> Option<Value>;

    /// Visits every entry of this layer only; stops when `f` returns false.
    fn range(&self, f: &mut dyn FnMut(&str, &Value) -> bool);
}

/// Read-only layer.
#[derive(Debug, Clone, Default)]
pub struct Fixed {
    entries: BTreeMap<String, Value>,
}

impl Fixed {
    pub fn new(entries: BTreeMap<String, Value>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Fixed {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl Layer for Fixed {
    fn get(&self, key: &str) -> Option<Value> {
        self.entries.get(key).cloned()
    }

    fn range(&self, f: &mut dyn FnMut(&str, &Value) -> bool) {
        for (k, v) in &self.entries {
            if !f(k, v) {
                break;
            }
        }
    }
}

/// Concurrently mutable layer.
#[derive(Debug, Default)]
pub struct Dynamic {
    entries: RwLock<BTreeMap<String, Value>>,
}

impl Dynamic {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.into(), value.into());
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)
    }

    /// Point-in-time copy of this layer.
    pub fn snapshot(&self) -> Fixed {
        Fixed::new(
            self.entries
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        )
    }
}

impl Layer for Dynamic {
    fn get(&self, key: &str) -> Option<Value> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn range(&self, f: &mut dyn FnMut(&str, &Value) -> bool) {
        // Iterate a snapshot so callbacks may call back into this layer.
        for (k, v) in &self.snapshot().entries {
            if !f(k, v) {
                break;
            }
        }
    }
}

/// Ordered override scopes, front first.
#[derive(Debug, Clone, Default)]
pub struct Options {
    layers: Vec<Arc<dyn Layer>>,
}

impl Options {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(layer: Arc<dyn Layer>) -> Self {
        Self {
            layers: vec![layer],
        }
    }

    /// Returns a new chain with `layer` in front of `self`.
    pub fn with_front(&self, layer: Arc<dyn Layer>) -> Self {
        let mut layers = Vec::with_capacity(self.layers.len() + 1);
        layers.push(layer);
        layers.extend(self.layers.iter().cloned());
        Self { layers }
    }

    /// Returns a new chain with `base` appended behind `self`.
    pub fn with_base(&self, base: &Options) -> Self {
        let mut layers = self.layers.clone();
        layers.extend(base.layers.iter().cloned());
        Self { layers }
    }

    pub fn front(&self) -> Option<&Arc<dyn Layer>> {
        self.layers.first()
    }

    /// Everything behind the front layer.
    pub fn base(&self) -> Options {
        Self {
            layers: self.layers.iter().skip(1).cloned().collect(),
        }
    }

    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    /// Value from the nearest layer defining `key`.
    pub fn value(&self, key: &str) -> Option<Value> {
        self.layers.iter().find_map(|layer| layer.get(key))
    }

    /// Visits the front layer only.
    pub fn range(&self, mut f: impl FnMut(&str, &Value) -> bool) {
        if let Some(front) = self.front() {
            front.range(&mut f);
        }
    }

    pub fn int(&self, key: &str, default: i64) -> i64 {
        self.value(key)
            .and_then(|v| v.as_i64())
            .unwrap_or(default)
    }

    pub fn uint(&self, key: &str, default: u64) -> u64 {
        self.value(key)
            .and_then(|v| v.as_u64())
            .unwrap_or(default)
    }

    pub fn string(&self, key: &str, default: &str) -> String {
        self.value(key)
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| default.to_string())
    }

    pub fn boolean(&self, key: &str, default: bool) -> bool {
        self.value(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(default)
    }

    pub fn duration_ms(&self, key: &str, default: Duration) -> Duration {
        self.value(key)
            .and_then(|v| v.as_duration())
            .unwrap_or(default)
    }

    pub fn connect_timeout(&self) -> Duration {
        self.duration_ms(keys::CONN_TIMEOUT, DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn read_timeout(&self) -> Duration {
        self.duration_ms(keys::READ_TIMEOUT, Duration::ZERO)
    }

    pub fn write_timeout(&self) -> Duration {
        self.duration_ms(keys::WRITE_TIMEOUT, Duration::ZERO)
    }

    pub fn retry(&self) -> u64 {
        self.uint(keys::RETRY, 0)
    }

    /// Connect + read + write budget for one attempt.
    pub fn total_timeout(&self) -> Duration {
        self.connect_timeout()
            .saturating_add(self.read_timeout())
            .saturating_add(self.write_timeout())
    }
}
