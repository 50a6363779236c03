// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use super::{
    ConnectError, Connector, Dialer, HasStrategy, ProxyConfig, ProxyError, ProxySetter,
    SocketTuning, TcpDialer,
};
use crate::address::{addresses_from_message, Address};
use crate::conn::{Conn, ConnTracer};
use crate::context::{Context, ContextError};
use crate::messager::{Consumer, Message};
use crate::option::{keys, options_from_message, DEFAULT_CONNECT_TIMEOUT};
use crate::picker::AddressPicker;
use crate::pool::ConnPool;

/// Picker + pool + dialer.
///
/// Consumes address updates (pushed to the picker, stale pool entries
/// pruned) and option updates (connect timeout refreshed).
pub struct DefaultConnector {
    dialer: Arc<dyn Dialer>,
    picker: Option<Arc<dyn AddressPicker>>,
    pool: Option<Arc<dyn ConnPool>>,
    downstream: Vec<Arc<dyn Consumer>>,
    tracers: Vec<Arc<dyn ConnTracer>>,
    tuning: SocketTuning,
    connect_timeout_ms: AtomicU64,
    proxy: RwLock<Option<ProxyConfig>>,
}

pub struct DefaultConnectorBuilder {
    dialer: Arc<dyn Dialer>,
    picker: Option<Arc<dyn AddressPicker>>,
    pool: Option<Arc<dyn ConnPool>>,
    tracers: Vec<Arc<dyn ConnTracer>>,
    tuning: SocketTuning,
    connect_timeout: Duration,
}

impl DefaultConnectorBuilder {
    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    pub fn picker(mut self, picker: Arc<dyn AddressPicker>) -> Self {
        self.picker = Some(picker);
        self
    }

    pub fn pool(mut self, pool: Arc<dyn ConnPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn tracer(mut self, tracer: Arc<dyn ConnTracer>) -> Self {
        self.tracers.push(tracer);
        self
    }

    pub fn tuning(mut self, tuning: SocketTuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn build(self) -> DefaultConnector {
        let mut tracers = self.tracers;
        let mut downstream = Vec::new();
        if let Some(picker) = &self.picker {
            tracers.extend(picker.conn_tracer());
            downstream.extend(Arc::clone(picker).as_consumer());
        }
        if let Some(pool) = &self.pool {
            tracers.extend(pool.conn_tracer());
            downstream.extend(Arc::clone(pool).as_consumer());
        }
        DefaultConnector {
            dialer: self.dialer,
            picker: self.picker,
            pool: self.pool,
            downstream,
            tracers,
            tuning: self.tuning,
            connect_timeout_ms: AtomicU64::new(duration_ms(self.connect_timeout)),
            proxy: RwLock::new(None),
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl DefaultConnector {
    pub fn builder() -> DefaultConnectorBuilder {
        DefaultConnectorBuilder {
            dialer: Arc::new(TcpDialer),
            picker: None,
            pool: None,
            tracers: Vec::new(),
            tuning: SocketTuning::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.load(Ordering::Relaxed))
    }

    pub fn picker(&self) -> Option<&Arc<dyn AddressPicker>> {
        self.picker.as_ref()
    }

    fn apply_addresses(&self, addrs: &[Address]) {
        if let Some(picker) = &self.picker {
            if let Err(e) = picker.set_addresses(addrs.to_vec()) {
                warn!(error = %e, "connector: failed to update picker addresses");
            }
        }
        if let Some(pool) = &self.pool {
            if let Err(e) = pool.retain(addrs) {
                warn!(error = %e, "connector: failed to prune connection pool");
            }
        }
        debug!(count = addrs.len(), "connector: address set updated");
    }
}

#[async_trait]
impl Connector for DefaultConnector {
    fn pick(&self, ctx: &Context) -> Result<Address, ConnectError> {
        let picker = self
            .picker
            .as_ref()
            .ok_or(ConnectError::Unconfigured("address picker"))?;
        Ok(picker.pick(ctx)?)
    }

    async fn connect(&self, ctx: &Context, addr: &Address) -> Result<Conn, ConnectError> {
        if let Some(e) = ctx.err() {
            return Err(e.into());
        }
        if self.picker.is_none() {
            return Err(ConnectError::Unconfigured("address picker"));
        }

        if let Some(raw) = self.pool.as_ref().and_then(|pool| pool.get(addr)) {
            return Ok(Conn::new(
                addr.clone(),
                raw,
                true,
                Duration::ZERO,
                self.tracers.clone(),
            ));
        }

        let started = Instant::now();
        let own = started.checked_add(self.connect_timeout());
        let deadline = match (own, ctx.deadline()) {
            (Some(own), Some(caller)) => own.min(caller),
            (Some(own), None) => own,
            (None, Some(caller)) => caller,
            (None, None) => started + Duration::from_secs(86_400 * 365),
        };

        let dialed = tokio::select! {
            biased;
            _ = ctx.token().cancelled() => Err(ConnectError::Context(ContextError::Cancelled)),
            res = timeout_at(deadline, self.dialer.dial(addr, deadline)) => match res {
                Ok(Ok(raw)) => Ok(raw),
                Ok(Err(source)) => Err(ConnectError::DialFailure {
                    addr: addr.to_string(),
                    source,
                }),
                Err(_) => Err(ConnectError::Timeout {
                    addr: addr.to_string(),
                    after: deadline.saturating_duration_since(started),
                }),
            },
        };

        let raw = match dialed {
            Ok(raw) => raw,
            Err(e) => {
                for tracer in &self.tracers {
                    tracer.on_dial_failure(addr, &e);
                }
                return Err(e);
            }
        };

        if let Some(stream) = raw.tcp_stream() {
            if let Err(e) = self.tuning.apply(stream) {
                warn!(addr = %addr, error = %e, "connector: failed to tune socket");
            }
        }

        Ok(Conn::new(
            addr.clone(),
            raw,
            false,
            started.elapsed(),
            self.tracers.clone(),
        ))
    }

    fn release(&self, conn: Conn) {
        let Some(pool) = &self.pool else {
            return;
        };
        if conn.stats().last_error.is_some() {
            return;
        }
        if let Some((addr, raw)) = conn.release() {
            pool.put(addr, raw);
        }
    }

    fn as_strategy(&self) -> Option<&dyn HasStrategy> {
        self.picker.as_ref().map(|_| self as &dyn HasStrategy)
    }

    fn as_proxy_setter(&self) -> Option<&dyn ProxySetter> {
        Some(self)
    }

    fn as_consumer(self: Arc<Self>) -> Option<Arc<dyn Consumer>> {
        Some(self)
    }
}

impl HasStrategy for DefaultConnector {
    fn strategy(&self) -> &str {
        self.picker.as_ref().map_or("", |p| p.name())
    }
}

impl ProxySetter for DefaultConnector {
    fn set_proxy(&self, config: ProxyConfig) -> Result<(), ProxyError> {
        *self.proxy.write().unwrap_or_else(|e| e.into_inner()) = Some(config);
        Ok(())
    }

    fn proxy(&self) -> Option<ProxyConfig> {
        self.proxy.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Consumer for DefaultConnector {
    fn consume(&self, msg: &Message) {
        if let Some(options) = options_from_message(msg) {
            if let Some(timeout) = options
                .value(keys::CONN_TIMEOUT)
                .and_then(|v| v.as_duration())
            {
                self.connect_timeout_ms
                    .store(duration_ms(timeout), Ordering::Relaxed);
                debug!(timeout_ms = duration_ms(timeout), "connector: connect timeout updated");
            }
        } else if let Some(addrs) = addresses_from_message(msg) {
            self.apply_addresses(addrs);
        }

        for consumer in &self.downstream {
            consumer.consume(msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::address_message;
    use crate::conn::tests::EventLog;
    use crate::conn::RawConn;
    use crate::option::{option_message, Fixed, Options, Value};
    use crate::picker::RoundRobin;
    use crate::pool::KeyedPool;
    use std::io;
    use std::sync::Mutex;

    /// Records dial attempts and their deadlines; refuses `refused:*` endpoints
    /// and never answers `blackhole:*` ones.
    #[derive(Default)]
    struct FakeDialer {
        dials: Mutex<Vec<(String, Instant)>>,
    }

    #[async_trait]
    impl Dialer for FakeDialer {
        async fn dial(&self, addr: &Address, deadline: Instant) -> io::Result<Box<dyn RawConn>> {
            self.dials
                .lock()
                .unwrap()
                .push((addr.endpoint().to_string(), deadline));
            if addr.endpoint().starts_with("refused") {
                return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
            }
            if addr.endpoint().starts_with("blackhole") {
                std::future::pending::<()>().await;
            }
            let (client, _server) = tokio::io::duplex(64);
            Ok(Box::new(client))
        }
    }

    fn connector(dialer: Arc<FakeDialer>, pool: Arc<KeyedPool>) -> DefaultConnector {
        DefaultConnector::builder()
            .dialer(dialer)
            .picker(Arc::new(RoundRobin::new()))
            .pool(pool)
            .connect_timeout(Duration::from_millis(100))
            .build()
    }

    #[tokio::test]
    async fn test_pool_hit_skips_dialer() {
        let dialer = Arc::new(FakeDialer::default());
        let pool = Arc::new(KeyedPool::default());
        let connector = connector(dialer.clone(), pool.clone());
        let addr = Address::tcp("a:1");

        let conn = connector.connect(&Context::background(), &addr).await.unwrap();
        assert!(!conn.is_reused());
        connector.release(conn);
        assert_eq!(pool.idle_count(&addr), 1);

        let conn = connector.connect(&Context::background(), &addr).await.unwrap();
        assert!(conn.is_reused());
        assert_eq!(dialer.dials.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_deadline_is_bounded_by_caller() {
        let dialer = Arc::new(FakeDialer::default());
        let connector = connector(dialer.clone(), Arc::new(KeyedPool::default()));

        let before = Instant::now();
        let ctx = Context::background().with_timeout(Duration::from_millis(20));
        connector.connect(&ctx, &Address::tcp("a:1")).await.unwrap();
        let loose = Context::background().with_timeout(Duration::from_secs(10));
        connector.connect(&loose, &Address::tcp("b:1")).await.unwrap();

        let dials = dialer.dials.lock().unwrap();
        assert!(dials[0].1 <= before + Duration::from_millis(20));
        assert!(dials[1].1 <= before + Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_timeout() {
        let connector = connector(Arc::new(FakeDialer::default()), Arc::new(KeyedPool::default()));
        let err = connector
            .connect(&Context::background(), &Address::tcp("blackhole:1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_dial_failure_notifies_tracers() {
        let log = Arc::new(EventLog::default());
        let connector = DefaultConnector::builder()
            .dialer(Arc::new(FakeDialer::default()))
            .picker(Arc::new(RoundRobin::new()))
            .tracer(log.clone())
            .build();
        let err = connector
            .connect(&Context::background(), &Address::tcp("refused:1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::DialFailure { .. }));
        assert!(log.events.lock().unwrap()[0].starts_with("dial-failure tcp://refused:1"));
    }

    #[tokio::test]
    async fn test_missing_picker_is_unconfigured() {
        let connector = DefaultConnector::builder()
            .dialer(Arc::new(FakeDialer::default()))
            .build();
        let err = connector
            .connect(&Context::background(), &Address::tcp("a:1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::Unconfigured(_)));
        assert!(connector.pick(&Context::background()).is_err());
        assert!(connector.as_strategy().is_none());
    }

    #[tokio::test]
    async fn test_cancelled_context() {
        let connector = connector(Arc::new(FakeDialer::default()), Arc::new(KeyedPool::default()));
        let ctx = Context::background();
        ctx.cancel();
        let err = connector.connect(&ctx, &Address::tcp("a:1")).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_consumes_address_and_option_updates() {
        let pool = Arc::new(KeyedPool::default());
        let connector = connector(Arc::new(FakeDialer::default()), pool.clone());
        let (a, b) = (Address::tcp("a:1"), Address::tcp("b:1"));
        pool.put(b.clone(), Box::new(tokio::io::duplex(8).0));

        connector.consume(&address_message(vec![a.clone()]));
        assert_eq!(connector.pick(&Context::background()).unwrap(), a);
        assert_eq!(pool.idle_count(&b), 0);

        let update: Fixed = [(keys::CONN_TIMEOUT, Value::Int(250))].into_iter().collect();
        connector.consume(&option_message(&Options::new(Arc::new(update))));
        assert_eq!(connector.connect_timeout(), Duration::from_millis(250));

        connector.consume(&option_message(&Options::empty()));
        assert_eq!(connector.connect_timeout(), Duration::from_millis(250));
        assert_eq!(connector.as_strategy().unwrap().strategy(), "round-robin");
    }
}
