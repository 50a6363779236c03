// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

/// Coarse classification shared by every error type in the crate.
///
/// Callers that only care about the failure category (retry on `Timeout`,
/// alert on `ConfigError`, ...) match on the kind instead of on each
/// module's own error enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Unknown service, strategy or discoverer kind.
    NotFound,
    /// Name collision in a registry.
    Duplicate,
    /// A required collaborator (picker, connector) is missing.
    Unconfigured,
    /// Transport-level failure while establishing a connection.
    DialFailure,
    /// A deadline was exceeded.
    Timeout,
    /// The caller cancelled the operation.
    Cancelled,
    /// Malformed or incomplete configuration.
    ConfigError,
    /// A panic recovered at a task boundary.
    Panic,
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::Duplicate => "duplicate",
            ErrorKind::Unconfigured => "unconfigured",
            ErrorKind::DialFailure => "dial failure",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::ConfigError => "config error",
            ErrorKind::Panic => "panic",
            ErrorKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// Renders a panic payload caught at a task boundary.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
