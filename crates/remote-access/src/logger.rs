// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Leveled work logging and the crate's tracing formatter.
//!
//! Component diagnostics use `tracing` directly. Per-call reporting goes
//! through a [`WorkLogger`], a cheap cloneable handle around an injected
//! [`Logger`] sink, so protocol-specific Request/Response implementations
//! can share the caller's logger without knowing where lines end up.
//!
//! Lines produced by [`Formatter`] look like:
//!
//! ```text
//! RAL | WARN | remote_access::ral | ral{service=user-db}: request failed errmsg="connection reset"
//! ```

use std::fmt;
use std::sync::Arc;

use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// One structured key/value pair attached to a log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub key: String,
    pub value: String,
}

impl Field {
    pub fn new(key: impl Into<String>, value: impl fmt::Display) -> Self {
        Self {
            key: key.into(),
            value: value.to_string(),
        }
    }
}

/// Renders a field list as `k=v k2=v2`.
pub struct Fields<'a>(pub &'a [Field]);

impl fmt::Display for Fields<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, field) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            if field.value.contains(char::is_whitespace) {
                write!(f, "{}={:?}", field.key, field.value)?;
            } else {
                write!(f, "{}={}", field.key, field.value)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Notice,
    Warning,
    Error,
}

/// Sink behind a [`WorkLogger`].
pub trait Logger: Send + Sync {
    fn log(&self, level: Level, message: &str, fields: &[Field]);
}

/// Forwards work log lines to `tracing` under the `ral_work` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: Level, message: &str, fields: &[Field]) {
        let fields = Fields(fields);
        match level {
            Level::Notice => tracing::info!(target: "ral_work", "{} {}", message, fields),
            Level::Warning => tracing::warn!(target: "ral_work", "{} {}", message, fields),
            Level::Error => tracing::error!(target: "ral_work", "{} {}", message, fields),
        }
    }
}

#[derive(Clone)]
pub struct WorkLogger {
    sink: Arc<dyn Logger>,
}

impl fmt::Debug for WorkLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkLogger").finish_non_exhaustive()
    }
}

impl Default for WorkLogger {
    fn default() -> Self {
        Self::new(Arc::new(TracingLogger))
    }
}

impl WorkLogger {
    pub fn new(sink: Arc<dyn Logger>) -> Self {
        Self { sink }
    }

    pub fn notice(&self, message: &str, fields: &[Field]) {
        self.sink.log(Level::Notice, message, fields);
    }

    pub fn warning(&self, message: &str, fields: &[Field]) {
        self.sink.log(Level::Warning, message, fields);
    }

    pub fn error(&self, message: &str, fields: &[Field]) {
        self.sink.log(Level::Error, message, fields);
    }
}

/// Capability of a Request or Response that wants the caller's work logger.
pub trait BindWorkLogger {
    fn bind_work_logger(&mut self, logger: WorkLogger);
}

/// Tracing formatter prefixing every line with `RAL`.
#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        write!(
            &mut writer,
            "RAL | {} | {} | ",
            metadata.level(),
            metadata.target()
        )?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;
                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{}}}", fields)?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Installs the global subscriber. `level` is an `EnvFilter` directive,
/// `RUST_LOG` wins when set.
pub fn init_tracing(level: &str) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| format!("invalid log level {level:?}: {e}"))?;

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .event_format(Formatter)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| format!("failed to install tracing subscriber: {e}"))
}
