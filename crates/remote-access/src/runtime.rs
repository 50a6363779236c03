// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::config::{ConfigError, RemoteAccessConfig};
use crate::context::Context;
use crate::logger::WorkLogger;
use crate::ral::Raller;
use crate::servicer::{
    LoadFailure, LoadOptions, LoadReport, Loader, Mapper, RetryHandle, ServicerFactory,
};

/// The process-wide pieces, built once at startup and passed to whoever
/// needs them: the service factory, the mapper holding loaded services
/// and the raller calling into them.
///
/// Background start retries scheduled by a load are owned by the runtime
/// and cancelled on shutdown.
#[derive(Clone)]
pub struct Runtime {
    config: RemoteAccessConfig,
    factory: Arc<ServicerFactory>,
    mapper: Arc<Mapper>,
    raller: Raller,
    retries: Arc<Mutex<Vec<RetryHandle>>>,
}

impl Runtime {
    pub fn new(config: RemoteAccessConfig, factory: ServicerFactory, logger: WorkLogger) -> Self {
        let mapper = Arc::new(Mapper::new());
        let raller = Raller::new(Arc::clone(&mapper)).with_logger(logger);
        Self {
            config,
            factory: Arc::new(factory),
            mapper,
            raller,
            retries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Reads `RAL_*` variables and builds a runtime with the default
    /// registries.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = RemoteAccessConfig::from_env()?;
        let factory = ServicerFactory::from_config(&config);
        Ok(Self::new(config, factory, WorkLogger::default()))
    }

    pub fn config(&self) -> &RemoteAccessConfig {
        &self.config
    }

    pub fn factory(&self) -> &Arc<ServicerFactory> {
        &self.factory
    }

    pub fn mapper(&self) -> &Arc<Mapper> {
        &self.mapper
    }

    pub fn raller(&self) -> &Raller {
        &self.raller
    }

    /// Loads the files matched by the configured glob.
    pub async fn load(&self, ctx: &Context) -> Result<LoadReport, LoadFailure> {
        let opts = LoadOptions::from_config(&self.config)?;
        self.load_with(ctx, &opts).await
    }

    /// Loads `opts.files`. The report's retry handle, if any, is kept by
    /// the runtime; see [`Runtime::wait_retries`].
    pub async fn load_with(
        &self,
        ctx: &Context,
        opts: &LoadOptions,
    ) -> Result<LoadReport, LoadFailure> {
        let outcome = Loader::new(Arc::clone(&self.factory))
            .load(ctx, &self.mapper, opts)
            .await;
        let mut report = match outcome {
            Ok(report) => report,
            Err(mut failure) => {
                self.keep_retry(failure.retry.take());
                return Err(failure);
            }
        };
        self.keep_retry(report.retry.take());
        info!(
            services = ?self.mapper.names(),
            retrying = ?report.retrying,
            "runtime: services loaded"
        );
        Ok(report)
    }

    fn keep_retry(&self, retry: Option<RetryHandle>) {
        if let Some(retry) = retry {
            self.retries
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(retry);
        }
    }

    fn take_retries(&self) -> Vec<RetryHandle> {
        std::mem::take(&mut *self.retries.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Waits for every pending start retry to end. Returns the services
    /// that never started.
    pub async fn wait_retries(&self) -> Vec<String> {
        let mut never_started = Vec::new();
        for retry in self.take_retries() {
            never_started.extend(retry.wait().await);
        }
        never_started
    }

    /// Cancels pending start retries, then stops every loaded service.
    pub async fn shutdown(&self) {
        let retries = self.take_retries();
        for retry in &retries {
            retry.cancel();
        }
        for retry in retries {
            let left = retry.wait().await;
            if !left.is_empty() {
                debug!(services = ?left, "runtime: start retries abandoned");
            }
        }
        self.mapper.shutdown().await;
    }
}
