// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A named downstream dependency: connector, discoverer and option scope
//! wired together by a private broker.

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::connector::Connector;
use crate::context::{Context, ContextError};
use crate::discoverer::{Discoverer, DiscoveryError};
use crate::error::ErrorKind;
use crate::logger::Field;
use crate::messager::{Broker, BrokerError, BrokerHandle, Producer};
use crate::option::{option_message, Dynamic, Layer, OptionUpdater, Options};
use crate::worker::{Worker, WorkerError};

pub mod config;
mod factory;
mod loader;
mod mapper;
mod reload;

pub use config::{ConfigHooks, ServicerConfig};
pub use factory::ServicerFactory;
pub use loader::{
    glob_to_regex, LoadError, LoadFailure, LoadOptions, LoadReport, Loader, RetryHandle,
};
pub use mapper::{Mapper, MapperError};
pub use reload::ConfigReloader;

const DEFAULT_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServicerState {
    Created,
    Starting,
    Running,
    StartFailed,
    Stopping,
    Stopped,
}

impl fmt::Display for ServicerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ServicerState::Created => "created",
            ServicerState::Starting => "starting",
            ServicerState::Running => "running",
            ServicerState::StartFailed => "start-failed",
            ServicerState::Stopping => "stopping",
            ServicerState::Stopped => "stopped",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServicerError {
    #[error("service {0:?} has no connector")]
    NoConnector(String),
    #[error("service {service:?} cannot {op} while {state}")]
    InvalidState {
        service: String,
        op: &'static str,
        state: ServicerState,
    },
    #[error("service {service:?}: {component} failed to start: {source}")]
    Start {
        service: String,
        component: &'static str,
        #[source]
        source: WorkerError,
    },
    #[error("service {service:?}: {component} failed to stop: {source}")]
    Stop {
        service: String,
        component: &'static str,
        #[source]
        source: WorkerError,
    },
    #[error("service {service:?}: initial discovery failed: {source}")]
    Discovery {
        service: String,
        #[source]
        source: DiscoveryError,
    },
    #[error("service {service:?}: initial discovery abandoned: {source}")]
    Context {
        service: String,
        #[source]
        source: ContextError,
    },
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl ServicerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServicerError::NoConnector(_) => ErrorKind::Unconfigured,
            ServicerError::Discovery { source, .. } => source.kind(),
            ServicerError::Context { source, .. } => source.kind(),
            ServicerError::Broker(e) => e.kind(),
            _ => ErrorKind::Other,
        }
    }
}

#[async_trait]
pub trait Servicer: Send + Sync {
    fn name(&self) -> &str;

    /// Service scope, stacked over the process defaults.
    fn option(&self) -> &Options;

    fn connector(&self) -> Option<Arc<dyn Connector>>;

    fn discoverer(&self) -> Option<Arc<dyn Discoverer>>;

    fn state(&self) -> ServicerState;

    /// Wires and starts the components. Calling it on a started service
    /// is a no-op.
    async fn start(&self, ctx: &Context) -> Result<(), ServicerError>;

    /// Stops the components in reverse start order. Only the first call
    /// does any work.
    async fn stop(&self) -> Result<(), ServicerError>;
}

struct Running {
    life: Context,
    broker: BrokerHandle,
}

pub struct DefaultServicer {
    name: String,
    option: Options,
    updates: Arc<Dynamic>,
    connector: Option<Arc<dyn Connector>>,
    discoverer: Option<Arc<dyn Discoverer>>,
    producers: Vec<Arc<dyn Producer>>,
    workers: Vec<Arc<dyn Worker>>,
    queue_capacity: usize,
    state: Mutex<ServicerState>,
    running: tokio::sync::Mutex<Option<Running>>,
}

pub struct DefaultServicerBuilder {
    name: String,
    service: Option<Arc<dyn Layer>>,
    base: Options,
    connector: Option<Arc<dyn Connector>>,
    discoverer: Option<Arc<dyn Discoverer>>,
    producers: Vec<Arc<dyn Producer>>,
    workers: Vec<Arc<dyn Worker>>,
    queue_capacity: usize,
}

impl DefaultServicerBuilder {
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn discoverer(mut self, discoverer: Arc<dyn Discoverer>) -> Self {
        self.discoverer = Some(discoverer);
        self
    }

    /// The service's own option layer.
    pub fn options(mut self, layer: Arc<dyn Layer>) -> Self {
        self.service = Some(layer);
        self
    }

    /// Scope behind the service layer, normally the process defaults.
    pub fn base(mut self, base: Options) -> Self {
        self.base = base;
        self
    }

    pub fn producer(mut self, producer: Arc<dyn Producer>) -> Self {
        self.producers.push(producer);
        self
    }

    pub fn worker(mut self, worker: Arc<dyn Worker>) -> Self {
        self.workers.push(worker);
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn build(self) -> DefaultServicer {
        let updates = Arc::new(Dynamic::new());
        let mut option = self.base;
        if let Some(service) = self.service {
            option = option.with_front(service);
        }
        let option = option.with_front(updates.clone());
        DefaultServicer {
            name: self.name,
            option,
            updates,
            connector: self.connector,
            discoverer: self.discoverer,
            producers: self.producers,
            workers: self.workers,
            queue_capacity: self.queue_capacity,
            state: Mutex::new(ServicerState::Created),
            running: tokio::sync::Mutex::new(None),
        }
    }
}

impl DefaultServicer {
    pub fn builder(name: impl Into<String>) -> DefaultServicerBuilder {
        DefaultServicerBuilder {
            name: name.into(),
            service: None,
            base: Options::empty(),
            connector: None,
            discoverer: None,
            producers: Vec::new(),
            workers: Vec::new(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    fn set_state(&self, state: ServicerState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn ordered_workers(&self) -> Vec<(&'static str, &dyn Worker)> {
        let mut out: Vec<(&'static str, &dyn Worker)> = Vec::new();
        if let Some(worker) = self.discoverer.as_ref().and_then(|d| d.as_worker()) {
            out.push(("discoverer", worker));
        }
        if let Some(worker) = self.connector.as_ref().and_then(|c| c.as_worker()) {
            out.push(("connector", worker));
        }
        out.extend(self.workers.iter().map(|w| ("worker", w.as_ref())));
        out
    }

    async fn stop_workers(&self, workers: &[(&'static str, &dyn Worker)]) -> Option<ServicerError> {
        let mut first = None;
        for (component, worker) in workers.iter().rev() {
            if let Err(source) = worker.stop().await {
                warn!(service = %self.name, component, error = %source, "servicer: stop failed");
                first.get_or_insert(ServicerError::Stop {
                    service: self.name.clone(),
                    component: *component,
                    source,
                });
            }
        }
        first
    }

    fn wire(&self, connector: &Arc<dyn Connector>) -> Broker {
        let mut broker = Broker::new(self.queue_capacity);
        let service = self.name.clone();
        broker.set_error_handler(Arc::new(move |e: BrokerError| {
            error!(service = %service, error = %e, "servicer: message delivery failed");
        }));

        let mut producers: Vec<&dyn Producer> = Vec::new();
        producers.extend(self.discoverer.as_ref().and_then(|d| d.as_producer()));
        producers.extend(connector.as_producer());
        producers.extend(self.producers.iter().map(|p| p.as_ref()));
        for producer in producers {
            if !broker.add_producer(producer) {
                warn!(service = %self.name, "servicer: producer stream already taken");
            }
        }

        broker.add_consumer(Arc::new(OptionUpdater::new(self.updates.clone())));
        if let Some(consumer) = self.discoverer.clone().and_then(|d| d.as_consumer()) {
            broker.add_consumer(consumer);
        }
        if let Some(consumer) = Arc::clone(connector).as_consumer() {
            broker.add_consumer(consumer);
        }
        broker
    }

    async fn bring_up(&self, ctx: &Context) -> Result<Running, ServicerError> {
        let connector = self
            .connector
            .as_ref()
            .ok_or_else(|| ServicerError::NoConnector(self.name.clone()))?;
        let mut broker = self.wire(connector);
        let life = Context::background().with_field(Field::new("service", &self.name));

        let workers = self.ordered_workers();
        for (started, (component, worker)) in workers.iter().enumerate() {
            if let Err(source) = worker.start(&life).await {
                self.stop_workers(&workers[..started]).await;
                life.cancel();
                return Err(ServicerError::Start {
                    service: self.name.clone(),
                    component: *component,
                    source,
                });
            }
        }

        // Initial state goes out before the dispatcher starts, so producer
        // messages can only follow it.
        broker.publish(&[option_message(&self.option)]);
        if let Some(discoverer) = &self.discoverer {
            let discovered = tokio::select! {
                res = discoverer.discover(ctx) => res.map_err(|source| ServicerError::Discovery {
                    service: self.name.clone(),
                    source,
                }),
                e = ctx.done() => Err(ServicerError::Context {
                    service: self.name.clone(),
                    source: e,
                }),
            };
            match discovered {
                Ok(msgs) => broker.publish(&msgs),
                Err(e) => {
                    self.stop_workers(&workers).await;
                    life.cancel();
                    return Err(e);
                }
            }
        }

        let handle = match broker.run(&life) {
            Ok(handle) => handle,
            Err(e) => {
                self.stop_workers(&workers).await;
                life.cancel();
                return Err(e.into());
            }
        };

        Ok(Running {
            life,
            broker: handle,
        })
    }
}

#[async_trait]
impl Servicer for DefaultServicer {
    fn name(&self) -> &str {
        &self.name
    }

    fn option(&self) -> &Options {
        &self.option
    }

    fn connector(&self) -> Option<Arc<dyn Connector>> {
        self.connector.clone()
    }

    fn discoverer(&self) -> Option<Arc<dyn Discoverer>> {
        self.discoverer.clone()
    }

    fn state(&self) -> ServicerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn start(&self, ctx: &Context) -> Result<(), ServicerError> {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match *state {
                ServicerState::Created => *state = ServicerState::Starting,
                ServicerState::Starting | ServicerState::Running => return Ok(()),
                other => {
                    return Err(ServicerError::InvalidState {
                        service: self.name.clone(),
                        op: "start",
                        state: other,
                    })
                }
            }
        }

        let began = Instant::now();
        match self.bring_up(ctx).await {
            Ok(running) => {
                *self.running.lock().await = Some(running);
                self.set_state(ServicerState::Running);
                info!(
                    service = %self.name,
                    cost_ms = u64::try_from(began.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "servicer: started"
                );
                Ok(())
            }
            Err(e) => {
                self.set_state(ServicerState::StartFailed);
                error!(service = %self.name, error = %e, "servicer: start failed");
                Err(e)
            }
        }
    }

    async fn stop(&self) -> Result<(), ServicerError> {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match *state {
                ServicerState::Running => *state = ServicerState::Stopping,
                ServicerState::Created | ServicerState::StartFailed => {
                    *state = ServicerState::Stopped;
                    return Ok(());
                }
                ServicerState::Stopping | ServicerState::Stopped => return Ok(()),
                ServicerState::Starting => {
                    return Err(ServicerError::InvalidState {
                        service: self.name.clone(),
                        op: "stop",
                        state: ServicerState::Starting,
                    })
                }
            }
        }

        let first = self.stop_workers(&self.ordered_workers()).await;
        if let Some(running) = self.running.lock().await.take() {
            running.life.cancel();
            running.broker.shutdown().await;
        }
        self.set_state(ServicerState::Stopped);
        debug!(service = %self.name, "servicer: stopped");
        first.map_or(Ok(()), Err)
    }
}
