// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Typed message envelope and the producer/consumer seams of the [`Broker`].

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;

mod broker;

pub use broker::{Broker, BrokerError, BrokerHandle, ErrorHandler};

static KINDS: RwLock<Vec<&'static str>> = RwLock::new(Vec::new());

/// Opaque tag identifying what a [`Message`] carries.
///
/// Tags are minted at runtime by [`MessageKind::register`]; every subsystem
/// registers its canonical kind once and keeps the returned value around.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageKind(u32);

impl MessageKind {
    pub fn register(name: &'static str) -> Self {
        let mut kinds = KINDS.write().unwrap_or_else(|e| e.into_inner());
        kinds.push(name);
        MessageKind(u32::try_from(kinds.len() - 1).unwrap_or(u32::MAX))
    }

    pub fn name(&self) -> &'static str {
        KINDS
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(self.0 as usize)
            .copied()
            .unwrap_or("unregistered")
    }
}

impl fmt::Debug for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageKind({}:{})", self.0, self.name())
    }
}

#[derive(Clone)]
pub struct Message {
    kind: MessageKind,
    payload: Arc<dyn Any + Send + Sync>,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl Message {
    pub fn new<T: Any + Send + Sync>(kind: MessageKind, payload: T) -> Self {
        Self {
            kind,
            payload: Arc::new(payload),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn is(&self, kind: MessageKind) -> bool {
        self.kind == kind
    }

    /// Payload of a message of `kind`, or `None` if either the tag or the
    /// payload type does not match.
    pub fn payload<T: Any>(&self, kind: MessageKind) -> Option<&T> {
        if !self.is(kind) {
            return None;
        }
        self.payload.downcast_ref::<T>()
    }
}

/// Source of messages. The stream is handed out once, to the broker that
/// drains it.
pub trait Producer: Send + Sync {
    fn messages(&self) -> Option<mpsc::Receiver<Message>>;
}

/// Synchronous message callback.
pub trait Consumer: Send + Sync {
    fn consume(&self, msg: &Message);
}

/// Producer backed by an mpsc channel; clones of the sender feed it.
pub struct ChannelProducer {
    rx: Mutex<Option<mpsc::Receiver<Message>>>,
}

impl ChannelProducer {
    pub fn new(capacity: usize) -> (Self, mpsc::Sender<Message>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                rx: Mutex::new(Some(rx)),
            },
            tx,
        )
    }
}

impl Producer for ChannelProducer {
    fn messages(&self) -> Option<mpsc::Receiver<Message>> {
        self.rx.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}
