// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Traced connections handed out by a connector.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::address::Address;

/// A raw byte stream produced by a dialer.
pub trait RawConn: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Exposes the TCP socket so connectors can tune it.
    fn tcp_stream(&self) -> Option<&TcpStream> {
        None
    }
}

impl RawConn for TcpStream {
    fn tcp_stream(&self) -> Option<&TcpStream> {
        Some(self)
    }
}

impl RawConn for tokio::io::DuplexStream {}

/// Counters and timings of one connection checkout.
#[derive(Debug, Clone)]
pub struct ConnStats {
    pub reused: bool,
    pub connected_at: Instant,
    /// Time spent dialing; zero for pooled connections.
    pub connect_cost: std::time::Duration,
    pub first_byte_at: Option<Instant>,
    pub closed_at: Option<Instant>,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub last_error: Option<String>,
}

impl ConnStats {
    fn new(reused: bool, connect_cost: std::time::Duration) -> Self {
        Self {
            reused,
            connected_at: Instant::now(),
            connect_cost,
            first_byte_at: None,
            closed_at: None,
            bytes_read: 0,
            bytes_written: 0,
            last_error: None,
        }
    }
}

/// Observer of connection events. Pickers and pools contribute one to learn
/// about connection health.
pub trait ConnTracer: Send + Sync {
    fn on_create(&self, _addr: &Address, _stats: &ConnStats) {}

    fn on_read(&self, _addr: &Address, _n: usize, _err: Option<&io::Error>) {}

    fn on_write(&self, _addr: &Address, _n: usize, _err: Option<&io::Error>) {}

    fn on_close(&self, _addr: &Address, _stats: &ConnStats) {}

    fn on_dial_failure(&self, _addr: &Address, _err: &(dyn std::error::Error + 'static)) {}
}

/// A checked-out connection. Reads and writes are counted and reported to
/// every attached tracer; dropping or shutting it down reports a close,
/// [`Conn::release`] hands the raw stream back for pooling instead.
pub struct Conn {
    addr: Address,
    inner: Option<Box<dyn RawConn>>,
    stats: ConnStats,
    tracers: Vec<Arc<dyn ConnTracer>>,
    closed: bool,
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("addr", &self.addr)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl Conn {
    pub(crate) fn new(
        addr: Address,
        inner: Box<dyn RawConn>,
        reused: bool,
        connect_cost: std::time::Duration,
        tracers: Vec<Arc<dyn ConnTracer>>,
    ) -> Self {
        let conn = Self {
            addr,
            inner: Some(inner),
            stats: ConnStats::new(reused, connect_cost),
            tracers,
            closed: false,
        };
        for tracer in &conn.tracers {
            tracer.on_create(&conn.addr, &conn.stats);
        }
        conn
    }

    pub fn address(&self) -> &Address {
        &self.addr
    }

    pub fn stats(&self) -> &ConnStats {
        &self.stats
    }

    pub fn is_reused(&self) -> bool {
        self.stats.reused
    }

    /// Detaches the raw stream for reuse without reporting a close.
    pub fn release(mut self) -> Option<(Address, Box<dyn RawConn>)> {
        self.closed = true;
        let inner = self.inner.take()?;
        Some((self.addr.clone(), inner))
    }

    fn record_error(&mut self, err: &io::Error) {
        self.stats.last_error = Some(err.to_string());
    }

    fn report_close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.stats.closed_at = Some(Instant::now());
        for tracer in &self.tracers {
            tracer.on_close(&self.addr, &self.stats);
        }
    }

    fn inner_mut(&mut self) -> io::Result<&mut Box<dyn RawConn>> {
        self.inner
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection released"))
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        self.report_close();
    }
}

impl AsyncRead for Conn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let inner = match this.inner_mut() {
            Ok(inner) => inner,
            Err(e) => return Poll::Ready(Err(e)),
        };
        let res = Pin::new(inner).poll_read(cx, buf);
        if let Poll::Ready(ref outcome) = res {
            let n = buf.filled().len() - before;
            match outcome {
                Ok(()) => {
                    if n > 0 && this.stats.first_byte_at.is_none() {
                        this.stats.first_byte_at = Some(Instant::now());
                    }
                    this.stats.bytes_read += n as u64;
                    for tracer in &this.tracers {
                        tracer.on_read(&this.addr, n, None);
                    }
                }
                Err(e) => {
                    this.record_error(e);
                    for tracer in &this.tracers {
                        tracer.on_read(&this.addr, 0, Some(e));
                    }
                }
            }
        }
        res
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let inner = match this.inner_mut() {
            Ok(inner) => inner,
            Err(e) => return Poll::Ready(Err(e)),
        };
        let res = Pin::new(inner).poll_write(cx, buf);
        match &res {
            Poll::Ready(Ok(n)) => {
                this.stats.bytes_written += *n as u64;
                for tracer in &this.tracers {
                    tracer.on_write(&this.addr, *n, None);
                }
            }
            Poll::Ready(Err(e)) => {
                this.record_error(e);
                for tracer in &this.tracers {
                    tracer.on_write(&this.addr, 0, Some(e));
                }
            }
            Poll::Pending => {}
        }
        res
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.inner_mut() {
            Ok(inner) => Pin::new(inner).poll_flush(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let inner = match this.inner_mut() {
            Ok(inner) => inner,
            Err(e) => return Poll::Ready(Err(e)),
        };
        let res = Pin::new(inner).poll_shutdown(cx);
        if let Poll::Ready(outcome) = &res {
            if let Err(e) = outcome {
                this.record_error(e);
            }
            this.report_close();
        }
        res
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[derive(Default)]
    pub(crate) struct EventLog {
        pub(crate) events: Mutex<Vec<String>>,
    }

    impl ConnTracer for EventLog {
        fn on_create(&self, addr: &Address, stats: &ConnStats) {
            self.events
                .lock()
                .unwrap()
                .push(format!("create {} reused={}", addr, stats.reused));
        }

        fn on_read(&self, _addr: &Address, n: usize, _err: Option<&io::Error>) {
            self.events.lock().unwrap().push(format!("read {n}"));
        }

        fn on_write(&self, _addr: &Address, n: usize, _err: Option<&io::Error>) {
            self.events.lock().unwrap().push(format!("write {n}"));
        }

        fn on_close(&self, _addr: &Address, stats: &ConnStats) {
            self.events.lock().unwrap().push(format!(
                "close r={} w={}",
                stats.bytes_read, stats.bytes_written
            ));
        }

        fn on_dial_failure(&self, addr: &Address, err: &(dyn std::error::Error + 'static)) {
            self.events
                .lock()
                .unwrap()
                .push(format!("dial-failure {addr}: {err}"));
        }
    }

    #[tokio::test]
    async fn test_counts_bytes_and_reports_close() {
        let (client, mut server) = tokio::io::duplex(64);
        let log = Arc::new(EventLog::default());
        let mut conn = Conn::new(
            Address::tcp("peer:1"),
            Box::new(client),
            false,
            std::time::Duration::ZERO,
            vec![log.clone()],
        );

        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        server.write_all(b"pong!").await.unwrap();

        let mut reply = [0u8; 5];
        conn.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong!");
        assert_eq!(conn.stats().bytes_written, 4);
        assert_eq!(conn.stats().bytes_read, 5);
        assert!(conn.stats().first_byte_at.is_some());

        conn.shutdown().await.unwrap();
        drop(conn);

        let events = log.events.lock().unwrap();
        assert_eq!(events.first().unwrap(), "create tcp://peer:1 reused=false");
        assert_eq!(events.last().unwrap(), "close r=5 w=4");
        assert_eq!(events.iter().filter(|e| e.starts_with("close")).count(), 1);
    }

    #[tokio::test]
    async fn test_release_skips_close() {
        let (client, _server) = tokio::io::duplex(8);
        let log = Arc::new(EventLog::default());
        let conn = Conn::new(
            Address::tcp("peer:1"),
            Box::new(client),
            true,
            std::time::Duration::ZERO,
            vec![log.clone()],
        );

        let (addr, _raw) = conn.release().unwrap();
        assert_eq!(addr, Address::tcp("peer:1"));
        assert!(!log
            .events
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.starts_with("close")));
    }
}
