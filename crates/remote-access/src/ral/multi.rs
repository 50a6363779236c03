// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{CallOptions, RalError, Raller, Request};
use crate::context::Context;
use crate::error::ErrorKind;

#[async_trait]
trait ErasedCall: Send {
    async fn call(
        &mut self,
        raller: &Raller,
        ctx: &Context,
        service: &str,
        opts: CallOptions,
    ) -> Result<(), RalError>;

    fn as_any(&self) -> &dyn Any;
}

struct Pair<R: Request> {
    request: R,
    response: R::Response,
}

#[async_trait]
impl<R: Request> ErasedCall for Pair<R> {
    async fn call(
        &mut self,
        raller: &Raller,
        ctx: &Context,
        service: &str,
        opts: CallOptions,
    ) -> Result<(), RalError> {
        raller
            .ral(ctx, service, &mut self.request, &mut self.response, opts)
            .await
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// One entry of a [`Raller::multi_ral`] fan-out.
///
/// The error slot is written by the call's own task, so it may change
/// after `multi_ral` has returned.
pub struct RalParam {
    service: String,
    options: CallOptions,
    ctx: Option<Context>,
    call: tokio::sync::Mutex<Box<dyn ErasedCall>>,
    error: Mutex<Option<RalError>>,
    finished: AtomicBool,
}

impl fmt::Debug for RalParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RalParam")
            .field("service", &self.service)
            .field("finished", &self.is_finished())
            .finish_non_exhaustive()
    }
}

impl RalParam {
    pub fn new<R: Request>(service: impl Into<String>, request: R, response: R::Response) -> Self {
        Self {
            service: service.into(),
            options: CallOptions::default(),
            ctx: None,
            call: tokio::sync::Mutex::new(Box::new(Pair { request, response })),
            error: Mutex::new(None),
            finished: AtomicBool::new(false),
        }
    }

    pub fn with_options(mut self, options: CallOptions) -> Self {
        self.options = options;
        self
    }

    /// Runs this call under `ctx` instead of the fan-out's context, so the
    /// caller can cancel it on its own.
    pub fn with_context(mut self, ctx: Context) -> Self {
        self.ctx = Some(ctx);
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn context(&self) -> Option<&Context> {
        self.ctx.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// `None` once the call succeeded.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(RalError::kind)
    }

    pub fn error_message(&self) -> Option<String> {
        self.error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(ToString::to_string)
    }

    pub fn take_error(&self) -> Option<RalError> {
        self.error.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Reads the response. Waits while the call is still running.
    pub async fn with_response<R: Request, T>(
        &self,
        f: impl FnOnce(&R::Response) -> T,
    ) -> Option<T> {
        let call = self.call.lock().await;
        call.as_any()
            .downcast_ref::<Pair<R>>()
            .map(|pair| f(&pair.response))
    }

    pub(super) fn arm(&self) {
        self.finished.store(false, Ordering::Release);
        *self.error.lock().unwrap_or_else(|e| e.into_inner()) = Some(RalError::Timeout);
    }

    pub(super) async fn call(&self, raller: &Raller, ctx: &Context) -> Result<(), RalError> {
        let mut call = self.call.lock().await;
        call.call(raller, ctx, &self.service, self.options.clone())
            .await
    }

    pub(super) fn settle(&self, outcome: Result<(), RalError>) {
        *self.error.lock().unwrap_or_else(|e| e.into_inner()) = outcome.err();
        self.finished.store(true, Ordering::Release);
    }
}
