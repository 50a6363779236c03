// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use remote_access::conn::RawConn;
use remote_access::connector::Dialer;
use remote_access::discoverer::{DiscovererFactory, DiscoveryError};
use remote_access::option::Options;
use remote_access::ral::Response;
use remote_access::{
    Address, Connector, Context, Discoverer, Message, Request, RequestError, StaticDiscoverer,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;

/// In-memory dialer. Every dial opens a duplex stream whose far end echoes
/// bytes back, and the dialed endpoint is recorded.
#[derive(Default)]
pub struct RecordingDialer {
    dialed: Mutex<Vec<String>>,
}

impl RecordingDialer {
    pub fn dialed(&self) -> Vec<String> {
        self.dialed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Dialer for RecordingDialer {
    async fn dial(&self, addr: &Address, _deadline: Instant) -> io::Result<Box<dyn RawConn>> {
        self.dialed.lock().unwrap().push(addr.endpoint().to_string());
        let (client, server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let (mut r, mut w) = tokio::io::split(server);
            let _ = tokio::io::copy(&mut r, &mut w).await;
        });
        Ok(Box::new(client))
    }
}

#[derive(Debug, Default)]
pub struct Reply {
    pub endpoint: String,
    pub body: Vec<u8>,
    pub reused: bool,
}

impl Response for Reply {}

/// Picks an address, sends `payload` and reads the echo back.
pub struct EchoRequest {
    pub payload: Vec<u8>,
    pub delay: Duration,
}

impl EchoRequest {
    pub fn new(payload: &str) -> Self {
        Self {
            payload: payload.as_bytes().to_vec(),
            delay: Duration::ZERO,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl Request for EchoRequest {
    type Response = Reply;

    fn describe(&self) -> String {
        format!("echo {}B", self.payload.len())
    }

    async fn execute(
        &mut self,
        ctx: &Context,
        response: &mut Reply,
        connector: &dyn Connector,
        _options: &Options,
    ) -> Result<(), RequestError> {
        let addr = connector.pick(ctx)?;
        let mut conn = connector.connect(ctx, &addr).await?;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        conn.write_all(&self.payload).await?;
        let mut body = vec![0; self.payload.len()];
        conn.read_exact(&mut body).await?;

        response.endpoint = addr.endpoint().to_string();
        response.body = body;
        response.reused = conn.is_reused();
        connector.release(conn);
        Ok(())
    }
}

/// Static discoverer that fails its first `failures` discoveries.
pub struct FlakyDiscoverer {
    inner: StaticDiscoverer,
    remaining: Arc<AtomicUsize>,
}

#[async_trait]
impl Discoverer for FlakyDiscoverer {
    async fn discover(&self, ctx: &Context) -> Result<Vec<Message>, DiscoveryError> {
        let left = self.remaining.load(Ordering::SeqCst);
        if left > 0 {
            self.remaining.store(left - 1, Ordering::SeqCst);
            return Err(DiscoveryError::Source("registry unavailable".to_string()));
        }
        self.inner.discover(ctx).await
    }

    fn describe(&self) -> String {
        format!("flaky({})", self.inner.describe())
    }
}

/// Factory for the `flaky` resource kind. The failure budget is shared by
/// every discoverer it builds, so rebuilt services eventually succeed.
pub fn flaky_factory(failures: usize) -> DiscovererFactory {
    let remaining = Arc::new(AtomicUsize::new(failures));
    Arc::new(
        move |locality: &str, params: &toml::Value| -> Result<Arc<dyn Discoverer>, DiscoveryError> {
            let inner = StaticDiscoverer::from_params(locality, params)?;
            Ok(Arc::new(FlakyDiscoverer {
                inner,
                remaining: Arc::clone(&remaining),
            }))
        },
    )
}

/// Static discoverer whose first discovery fails and whose later ones
/// never complete.
pub struct StallingDiscoverer {
    inner: StaticDiscoverer,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Discoverer for StallingDiscoverer {
    async fn discover(&self, _ctx: &Context) -> Result<Vec<Message>, DiscoveryError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(DiscoveryError::Source("registry unavailable".to_string()));
        }
        std::future::pending().await
    }

    fn describe(&self) -> String {
        format!("stalling({})", self.inner.describe())
    }
}

/// Factory for the `stalling` resource kind; `calls` counts discoveries
/// across every discoverer it builds.
pub fn stalling_factory(calls: Arc<AtomicUsize>) -> DiscovererFactory {
    Arc::new(
        move |locality: &str, params: &toml::Value| -> Result<Arc<dyn Discoverer>, DiscoveryError> {
            Ok(Arc::new(StallingDiscoverer {
                inner: StaticDiscoverer::from_params(locality, params)?,
                calls: Arc::clone(&calls),
            }))
        },
    )
}

/// Writes `<dir>/<file>.toml` describing a service on a static address
/// table.
pub fn write_service(dir: &Path, file: &str, name: &str, kind: &str, hosts: &[&str]) -> PathBuf {
    let hosts = hosts
        .iter()
        .map(|h| {
            let (host, port) = h.rsplit_once(':').unwrap();
            format!("{{ Host = \"{host}\", Port = {port} }}")
        })
        .collect::<Vec<_>>()
        .join(", ");
    let path = dir.join(format!("{file}.toml"));
    std::fs::write(
        &path,
        format!("Name = \"{name}\"\nConnTimeOut = 500\n\n[Resource.{kind}]\ndefault = [{hosts}]\n"),
    )
    .unwrap();
    path
}
