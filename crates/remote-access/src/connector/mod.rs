// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Producing ready connections to picked addresses.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::address::{Address, Network};
use crate::conn::{Conn, RawConn};
use crate::context::{Context, ContextError};
use crate::error::ErrorKind;
use crate::messager::{Consumer, Producer};
use crate::picker::PickerError;
use crate::worker::Worker;

mod default;
mod proxy;

pub use default::{DefaultConnector, DefaultConnectorBuilder};
pub use proxy::{ProxyConfig, ProxyError, ProxyProtocol, ProxySetter};

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("connector has no {0} configured")]
    Unconfigured(&'static str),
    #[error(transparent)]
    Pick(#[from] PickerError),
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error("dial {addr} timed out after {after:?}")]
    Timeout { addr: String, after: Duration },
    #[error("dial {addr} failed: {source}")]
    DialFailure {
        addr: String,
        #[source]
        source: io::Error,
    },
}

impl ConnectError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConnectError::Unconfigured(_) => ErrorKind::Unconfigured,
            ConnectError::Pick(e) => e.kind(),
            ConnectError::Context(e) => e.kind(),
            ConnectError::Timeout { .. } => ErrorKind::Timeout,
            ConnectError::DialFailure { .. } => ErrorKind::DialFailure,
        }
    }
}

/// Reports the load-balancing strategy in use.
pub trait HasStrategy {
    fn strategy(&self) -> &str;
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Next address according to the balancing strategy.
    fn pick(&self, ctx: &Context) -> Result<Address, ConnectError>;

    async fn connect(&self, ctx: &Context, addr: &Address) -> Result<Conn, ConnectError>;

    /// Hands a healthy connection back for reuse. The default closes it.
    fn release(&self, conn: Conn) {
        drop(conn);
    }

    fn as_strategy(&self) -> Option<&dyn HasStrategy> {
        None
    }

    fn as_proxy_setter(&self) -> Option<&dyn ProxySetter> {
        None
    }

    fn as_consumer(self: Arc<Self>) -> Option<Arc<dyn Consumer>> {
        None
    }

    fn as_producer(&self) -> Option<&dyn Producer> {
        None
    }

    fn as_worker(&self) -> Option<&dyn Worker> {
        None
    }
}

/// Raw byte-stream dial primitive.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Dials `addr`. Callers bound the attempt by `deadline`; implementations
    /// may use it to size their own internal timeouts.
    async fn dial(&self, addr: &Address, deadline: Instant) -> io::Result<Box<dyn RawConn>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &Address, _deadline: Instant) -> io::Result<Box<dyn RawConn>> {
        match addr.network() {
            Network::Tcp => Ok(Box::new(TcpStream::connect(addr.endpoint()).await?)),
            #[cfg(unix)]
            Network::Unix => Ok(Box::new(
                tokio::net::UnixStream::connect(addr.endpoint()).await?,
            )),
            other => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("network {other} cannot be dialed as a stream"),
            )),
        }
    }
}

#[cfg(unix)]
impl RawConn for tokio::net::UnixStream {}

/// TCP options applied to every freshly dialed socket.
#[derive(Debug, Clone, Copy)]
pub struct SocketTuning {
    pub keepalive: bool,
    pub keepalive_period: Duration,
    pub linger: Option<Duration>,
    pub nodelay: bool,
}

impl Default for SocketTuning {
    fn default() -> Self {
        Self {
            keepalive: true,
            keepalive_period: Duration::from_secs(1),
            linger: Some(Duration::from_secs(1)),
            nodelay: true,
        }
    }
}

impl SocketTuning {
    pub fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        let sock = SockRef::from(stream);
        sock.set_keepalive(self.keepalive)?;
        if self.keepalive {
            sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(self.keepalive_period))?;
        }
        sock.set_linger(self.linger)?;
        sock.set_nodelay(self.nodelay)
    }
}
