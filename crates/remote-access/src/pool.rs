// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::address::Address;
use crate::conn::{ConnTracer, RawConn};
use crate::error::ErrorKind;
use crate::messager::Consumer;

const DEFAULT_MAX_IDLE_PER_ADDRESS: usize = 2;
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("connection pool is closed")]
    Closed,
}

impl PoolError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Other
    }
}

/// Keyed store of reusable connections.
pub trait ConnPool: Send + Sync {
    /// A pooled connection for `addr`, if any.
    fn get(&self, addr: &Address) -> Option<Box<dyn RawConn>>;

    /// Offers a connection for reuse. The pool may drop it.
    fn put(&self, addr: Address, conn: Box<dyn RawConn>);

    /// Drops every entry whose address is not in `keep`; returns how many
    /// connections were dropped.
    fn retain(&self, keep: &[Address]) -> Result<usize, PoolError>;

    fn as_consumer(self: Arc<Self>) -> Option<Arc<dyn Consumer>> {
        None
    }

    fn conn_tracer(&self) -> Option<Arc<dyn ConnTracer>> {
        None
    }
}

struct Idle {
    since: Instant,
    conn: Box<dyn RawConn>,
}

#[derive(Default)]
struct PoolState {
    idle: HashMap<Address, VecDeque<Idle>>,
    closed: bool,
}

/// Per-address LIFO idle lists with a size cap and idle expiry.
pub struct KeyedPool {
    max_idle_per_address: usize,
    idle_timeout: Duration,
    state: Mutex<PoolState>,
}

impl Default for KeyedPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IDLE_PER_ADDRESS, DEFAULT_IDLE_TIMEOUT)
    }
}

impl KeyedPool {
    pub fn new(max_idle_per_address: usize, idle_timeout: Duration) -> Self {
        Self {
            max_idle_per_address,
            idle_timeout,
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn idle_count(&self, addr: &Address) -> usize {
        self.lock().idle.get(addr).map_or(0, VecDeque::len)
    }

    /// Drops every idle connection and refuses new ones.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.idle.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ConnPool for KeyedPool {
    fn get(&self, addr: &Address) -> Option<Box<dyn RawConn>> {
        let mut state = self.lock();
        let queue = state.idle.get_mut(addr)?;
        let now = Instant::now();
        while let Some(idle) = queue.pop_back() {
            if now.duration_since(idle.since) < self.idle_timeout {
                return Some(idle.conn);
            }
        }
        None
    }

    fn put(&self, addr: Address, conn: Box<dyn RawConn>) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        let cap = self.max_idle_per_address;
        let queue = state.idle.entry(addr).or_default();
        if queue.len() >= cap {
            return;
        }
        queue.push_back(Idle {
            since: Instant::now(),
            conn,
        });
    }

    fn retain(&self, keep: &[Address]) -> Result<usize, PoolError> {
        let mut state = self.lock();
        if state.closed {
            return Err(PoolError::Closed);
        }
        let keep: HashSet<&Address> = keep.iter().collect();
        let mut dropped = 0;
        state.idle.retain(|addr, queue| {
            let kept = keep.contains(addr);
            if !kept {
                dropped += queue.len();
            }
            kept
        });
        if dropped > 0 {
            debug!(dropped, "pool: pruned connections to vanished addresses");
        }
        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw() -> Box<dyn RawConn> {
        let (client, _server) = tokio::io::duplex(8);
        Box::new(client)
    }

    #[tokio::test]
    async fn test_get_returns_put_connection() {
        let pool = KeyedPool::default();
        let addr = Address::tcp("a:1");
        assert!(pool.get(&addr).is_none());

        pool.put(addr.clone(), raw());
        assert_eq!(pool.idle_count(&addr), 1);
        assert!(pool.get(&addr).is_some());
        assert!(pool.get(&addr).is_none());
    }

    #[tokio::test]
    async fn test_put_respects_cap() {
        let pool = KeyedPool::new(1, Duration::from_secs(60));
        let addr = Address::tcp("a:1");
        pool.put(addr.clone(), raw());
        pool.put(addr.clone(), raw());
        assert_eq!(pool.idle_count(&addr), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_are_skipped() {
        let pool = KeyedPool::new(4, Duration::from_secs(10));
        let addr = Address::tcp("a:1");
        pool.put(addr.clone(), raw());
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(pool.get(&addr).is_none());
        assert_eq!(pool.idle_count(&addr), 0);
    }

    #[tokio::test]
    async fn test_retain_prunes_vanished_addresses() {
        let pool = KeyedPool::default();
        let (a, b) = (Address::tcp("a:1"), Address::tcp("b:1"));
        pool.put(a.clone(), raw());
        pool.put(b.clone(), raw());
        pool.put(b.clone(), raw());

        assert_eq!(pool.retain(std::slice::from_ref(&a)).unwrap(), 2);
        assert_eq!(pool.idle_count(&a), 1);
        assert_eq!(pool.idle_count(&b), 0);
    }

    #[tokio::test]
    async fn test_closed_pool() {
        let pool = KeyedPool::default();
        let addr = Address::tcp("a:1");
        pool.put(addr.clone(), raw());
        pool.close();
        assert!(pool.get(&addr).is_none());
        pool.put(addr.clone(), raw());
        assert_eq!(pool.idle_count(&addr), 0);
        assert!(matches!(pool.retain(&[]), Err(PoolError::Closed)));
    }
}
