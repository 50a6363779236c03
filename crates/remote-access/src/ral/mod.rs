// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Call orchestration: resolve a service, merge option scopes, pick a
//! connector and drive a caller-supplied request.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::debug;

use crate::connector::{ConnectError, Connector};
use crate::context::{Context, ContextError};
use crate::error::{panic_message, ErrorKind};
use crate::logger::{BindWorkLogger, Field, WorkLogger};
use crate::option::{keys, Options};
use crate::servicer::Mapper;

mod event;
mod multi;
mod options;

pub use event::{CallEvent, EventRecorder, JsonLinesRecorder};
pub use multi::RalParam;
pub use options::CallOptions;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failure reported by a [`Request`].
///
/// `logged` tells the caller the request already reported the failure, so
/// the Raller skips its own warning. The error is returned either way.
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct RequestError {
    #[source]
    source: BoxError,
    kind: ErrorKind,
    logged: bool,
}

impl RequestError {
    pub fn new(source: impl Into<BoxError>) -> Self {
        Self {
            source: source.into(),
            kind: ErrorKind::Other,
            logged: false,
        }
    }

    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn already_logged(mut self) -> Self {
        self.logged = true;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_logged(&self) -> bool {
        self.logged
    }
}

impl From<ConnectError> for RequestError {
    fn from(e: ConnectError) -> Self {
        let kind = e.kind();
        Self::new(e).with_kind(kind)
    }
}

impl From<std::io::Error> for RequestError {
    fn from(e: std::io::Error) -> Self {
        let kind = if e.kind() == std::io::ErrorKind::TimedOut {
            ErrorKind::Timeout
        } else {
            ErrorKind::Other
        };
        Self::new(e).with_kind(kind)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RalError {
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error("service {0:?} not found")]
    NotFound(String),
    #[error("service {service:?}: option {key} holds a {found} value, expected a connector")]
    BadOverride {
        service: String,
        key: &'static str,
        found: &'static str,
    },
    #[error("service {0:?} has no connector")]
    NoConnector(String),
    #[error("service {service:?}: {source}")]
    Request {
        service: String,
        #[source]
        source: RequestError,
    },
    #[error("call panicked: {0}")]
    Panic(String),
    #[error("call did not complete before the wait ended")]
    Timeout,
}

impl RalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RalError::Context(e) => e.kind(),
            RalError::NotFound(_) => ErrorKind::NotFound,
            RalError::BadOverride { .. } => ErrorKind::ConfigError,
            RalError::NoConnector(_) => ErrorKind::Unconfigured,
            RalError::Request { source, .. } => source.kind(),
            RalError::Panic(_) => ErrorKind::Panic,
            RalError::Timeout => ErrorKind::Timeout,
        }
    }
}

pub trait Response: Send + 'static {
    fn as_logger_binder(&mut self) -> Option<&mut dyn BindWorkLogger> {
        None
    }
}

/// A protocol-specific call, e.g. one Redis command or one HTTP exchange.
#[async_trait]
pub trait Request: Send + 'static {
    type Response: Response;

    /// Short label for log lines and call events.
    fn describe(&self) -> String;

    /// Performs the exchange using `connector`, filling `response`.
    async fn execute(
        &mut self,
        ctx: &Context,
        response: &mut Self::Response,
        connector: &dyn Connector,
        options: &Options,
    ) -> Result<(), RequestError>;

    fn as_logger_binder(&mut self) -> Option<&mut dyn BindWorkLogger> {
        None
    }
}

/// Entry point for calls against the services in a [`Mapper`].
///
/// Cheap to clone; clones share the mapper, session scope, logger and
/// recorder.
#[derive(Clone)]
pub struct Raller {
    mapper: Arc<Mapper>,
    session: Options,
    logger: WorkLogger,
    recorder: Option<Arc<dyn EventRecorder>>,
}

impl Raller {
    pub fn new(mapper: Arc<Mapper>) -> Self {
        Self {
            mapper,
            session: Options::empty(),
            logger: WorkLogger::default(),
            recorder: None,
        }
    }

    /// Scope applied to every call, between the call and service scopes.
    pub fn with_session(mut self, session: Options) -> Self {
        self.session = session;
        self
    }

    pub fn with_logger(mut self, logger: WorkLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn EventRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn mapper(&self) -> &Arc<Mapper> {
        &self.mapper
    }

    pub fn logger(&self) -> &WorkLogger {
        &self.logger
    }

    fn resolve(
        &self,
        ctx: &Context,
        service: &str,
        opts: &CallOptions,
    ) -> Result<(Options, Arc<dyn Connector>), RalError> {
        if let Some(e) = ctx.err() {
            return Err(e.into());
        }
        let servicer = self
            .mapper
            .get(service)
            .ok_or_else(|| RalError::NotFound(service.to_string()))?;
        let options = opts.over(&self.session.with_base(servicer.option()));

        let connector = match options.value(keys::CONNECTOR) {
            Some(value) => value.downcast::<Arc<dyn Connector>>().ok_or_else(|| {
                RalError::BadOverride {
                    service: service.to_string(),
                    key: keys::CONNECTOR,
                    found: value.variant_name(),
                }
            })?,
            None => servicer
                .connector()
                .ok_or_else(|| RalError::NoConnector(service.to_string()))?,
        };
        Ok((options, connector))
    }

    /// Runs `request` against `service` and waits for it.
    pub async fn ral<R: Request>(
        &self,
        ctx: &Context,
        service: &str,
        request: &mut R,
        response: &mut R::Response,
        opts: CallOptions,
    ) -> Result<(), RalError> {
        let began = Instant::now();
        let mut fields = ctx.fields().to_vec();
        fields.extend_from_slice(opts.fields());
        let mut event = CallEvent::new(service, request.describe(), String::new(), &fields);

        let outcome = match self.resolve(ctx, service, &opts) {
            Ok((options, connector)) => {
                if let Some(binder) = request.as_logger_binder() {
                    binder.bind_work_logger(self.logger.clone());
                }
                if let Some(binder) = response.as_logger_binder() {
                    binder.bind_work_logger(self.logger.clone());
                }
                event.balance = connector
                    .as_strategy()
                    .map(|s| s.strategy().to_string())
                    .unwrap_or_default();

                request
                    .execute(ctx, response, connector.as_ref(), &options)
                    .await
                    .map_err(|source| {
                        if !source.is_logged() {
                            let mut line = vec![
                                Field::new("service", service),
                                Field::new("request", &event.request),
                                Field::new("balance", &event.balance),
                                Field::new("errmsg", &source),
                                Field::new("cost_ms", began.elapsed().as_millis()),
                            ];
                            line.extend(fields.iter().cloned());
                            self.logger.warning("ral: request failed", &line);
                        }
                        RalError::Request {
                            service: service.to_string(),
                            source,
                        }
                    })
            }
            Err(e) => Err(e),
        };

        event.cost_ms = u64::try_from(began.elapsed().as_millis()).unwrap_or(u64::MAX);
        if let Err(e) = &outcome {
            event.ok = false;
            event.error_kind = Some(e.kind().to_string());
            event.error = Some(e.to_string());
        }
        debug!(
            service = %service,
            request = %event.request,
            cost_ms = event.cost_ms,
            ok = event.ok,
            "ral: call finished"
        );
        if let Some(recorder) = &self.recorder {
            recorder.record(&event).await;
        }
        outcome
    }

    /// Runs the call on its own task. The receiver yields the filled
    /// response, or the error; a panic in the request becomes
    /// [`RalError::Panic`].
    pub fn go_ral<R: Request>(
        &self,
        ctx: &Context,
        service: &str,
        mut request: R,
        mut response: R::Response,
        opts: CallOptions,
    ) -> oneshot::Receiver<Result<R::Response, RalError>> {
        let (tx, rx) = oneshot::channel();
        let raller = self.clone();
        let ctx = ctx.clone();
        let service = service.to_string();
        tokio::spawn(async move {
            let outcome = catch_panic(async move {
                raller
                    .ral(&ctx, &service, &mut request, &mut response, opts)
                    .await
                    .map(|()| response)
            })
            .await;
            let _ = tx.send(outcome);
        });
        rx
    }

    /// Runs every param concurrently and waits until all have completed or
    /// `ctx` is done, whichever comes first.
    ///
    /// Each param's error slot starts as [`RalError::Timeout`] and is
    /// overwritten when its call completes, even after this method has
    /// returned. Calls still running when the wait ends are not cancelled;
    /// give a param its own context to be able to cancel it.
    pub async fn multi_ral(
        &self,
        ctx: &Context,
        params: &HashMap<String, Arc<RalParam>>,
    ) -> Result<(), RalError> {
        let (done_tx, mut done_rx) = mpsc::channel::<()>(params.len().max(1));
        for param in params.values() {
            param.arm();
            let raller = self.clone();
            let param = Arc::clone(param);
            let call_ctx = param.context().cloned().unwrap_or_else(|| ctx.clone());
            let done_tx = done_tx.clone();
            tokio::spawn(async move {
                let task_param = Arc::clone(&param);
                let outcome =
                    catch_panic(async move { task_param.call(&raller, &call_ctx).await }).await;
                param.settle(outcome);
                let _ = done_tx.send(()).await;
            });
        }
        drop(done_tx);

        tokio::select! {
            _ = async { while done_rx.recv().await.is_some() {} } => Ok(()),
            e = ctx.done() => Err(e.into()),
        }
    }
}

/// Polls `fut` on its own task so a panic surfaces as an error.
async fn catch_panic<T, F>(fut: F) -> Result<T, RalError>
where
    F: Future<Output = Result<T, RalError>> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(fut).await {
        Ok(outcome) => outcome,
        Err(join) if join.is_panic() => Err(RalError::Panic(panic_message(
            join.into_panic().as_ref(),
        ))),
        Err(join) => Err(RalError::Panic(join.to_string())),
    }
}
