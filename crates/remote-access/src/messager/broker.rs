// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::{Consumer, Message, Producer};
use crate::context::Context;
use crate::error::{panic_message, ErrorKind};

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("consumer panicked on {kind} message: {message}")]
    ConsumerPanic { kind: &'static str, message: String },
    #[error("broker already running")]
    AlreadyRunning,
}

impl BrokerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::ConsumerPanic { .. } => ErrorKind::Panic,
            BrokerError::AlreadyRunning => ErrorKind::Other,
        }
    }
}

pub type ErrorHandler = Arc<dyn Fn(BrokerError) + Send + Sync>;

/// In-process fan-out from producers to consumers.
///
/// Each producer gets a forwarding task feeding one shared queue; a single
/// dispatcher drains the queue and hands every message to every consumer
/// before taking the next one, so all consumers observe the same order.
/// Messages passed to [`Broker::publish`] take the same delivery gate, so
/// at most one message is inside the consumers at any time.
pub struct Broker {
    capacity: usize,
    producers: Vec<mpsc::Receiver<Message>>,
    consumers: Vec<Arc<dyn Consumer>>,
    on_error: Option<ErrorHandler>,
    gate: Arc<Mutex<()>>,
    running: bool,
}

#[derive(Clone)]
struct Dispatch {
    consumers: Vec<Arc<dyn Consumer>>,
    on_error: Option<ErrorHandler>,
    gate: Arc<Mutex<()>>,
}

impl Dispatch {
    fn deliver(&self, msg: &Message) {
        let _serial = self.gate.lock().unwrap_or_else(|e| e.into_inner());
        for consumer in &self.consumers {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| consumer.consume(msg))) {
                let err = BrokerError::ConsumerPanic {
                    kind: msg.kind().name(),
                    message: panic_message(payload.as_ref()),
                };
                match &self.on_error {
                    Some(handler) => handler(err),
                    None => error!(error = %err, "broker: message delivery failed"),
                }
            }
        }
    }
}

impl Broker {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            producers: Vec::new(),
            consumers: Vec::new(),
            on_error: None,
            gate: Arc::new(Mutex::new(())),
            running: false,
        }
    }

    /// Returns false when the producer's stream was already taken.
    pub fn add_producer(&mut self, producer: &dyn Producer) -> bool {
        match producer.messages() {
            Some(rx) => {
                self.producers.push(rx);
                true
            }
            None => false,
        }
    }

    pub fn add_consumer(&mut self, consumer: Arc<dyn Consumer>) {
        self.consumers.push(consumer);
    }

    pub fn set_error_handler(&mut self, handler: ErrorHandler) {
        self.on_error = Some(handler);
    }

    fn dispatch(&self) -> Dispatch {
        Dispatch {
            consumers: self.consumers.clone(),
            on_error: self.on_error.clone(),
            gate: Arc::clone(&self.gate),
        }
    }

    /// Delivers `msgs` to every consumer on the calling task.
    pub fn publish(&self, msgs: &[Message]) {
        let dispatch = self.dispatch();
        for msg in msgs {
            dispatch.deliver(msg);
        }
    }

    /// Spawns the forwarding and dispatch tasks. They stop when `ctx` is
    /// done or the returned handle is shut down; a message already being
    /// delivered finishes first.
    pub fn run(&mut self, ctx: &Context) -> Result<BrokerHandle, BrokerError> {
        if self.running {
            return Err(BrokerError::AlreadyRunning);
        }
        self.running = true;

        let token = ctx.token().child_token();
        let (tx, mut rx) = mpsc::channel::<Message>(self.capacity);
        let mut handles = Vec::with_capacity(self.producers.len() + 1);

        for mut source in std::mem::take(&mut self.producers) {
            let tx = tx.clone();
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let msg = tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        msg = source.recv() => msg,
                    };
                    let Some(msg) = msg else { break };
                    let sent = tokio::select! {
                        biased;
                        _ = token.cancelled() => false,
                        res = tx.send(msg) => res.is_ok(),
                    };
                    if !sent {
                        break;
                    }
                }
            }));
        }
        drop(tx);

        let dispatch = self.dispatch();
        let dispatch_token = token.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    biased;
                    _ = dispatch_token.cancelled() => break,
                    msg = rx.recv() => msg,
                };
                match msg {
                    Some(msg) => dispatch.deliver(&msg),
                    None => break,
                }
            }
            debug!("broker: dispatcher stopped");
        }));

        Ok(BrokerHandle { token, handles })
    }
}

#[derive(Debug)]
pub struct BrokerHandle {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl BrokerHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Cancels and waits for every broker task to exit.
    pub async fn shutdown(self) {
        self.token.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "broker: task ended abnormally");
            }
        }
    }
}
