//! Connection pool shared by every remote call of the client.
//!
//! The pool is an unbounded multiset of idle connections plus a factory. A leased
//! connection leaves the idle set until its [`PooledConnection`] guard is dropped
//! or explicitly released. Connections are health-checked both when leaving and
//! when re-entering the set. Dead connections are shut down in the background
//! and never handed out again. Growth is not capped here; callers bound their
//! own concurrency.

use async_trait::async_trait;
use crossbeam::queue::SegQueue;
use metrics::counter;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::telemetry::names;

/// Transport-level connectivity of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

impl ConnectivityState {
    /// `TransientFailure` and `Shutdown` connections are never reused.
    pub fn is_healthy(self) -> bool {
        !matches!(
            self,
            ConnectivityState::TransientFailure | ConnectivityState::Shutdown
        )
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            ConnectivityState::Idle => 0,
            ConnectivityState::Connecting => 1,
            ConnectivityState::Ready => 2,
            ConnectivityState::TransientFailure => 3,
            ConnectivityState::Shutdown => 4,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectivityState::Idle,
            1 => ConnectivityState::Connecting,
            2 => ConnectivityState::Ready,
            3 => ConnectivityState::TransientFailure,
            _ => ConnectivityState::Shutdown,
        }
    }
}

/// A reusable handle to the remote endpoint.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Identity of the handle, stable for its whole life.
    fn id(&self) -> u64;

    /// Current connectivity state.
    fn state(&self) -> ConnectivityState;

    /// Called by the client when a call through this connection failed at the
    /// transport level.
    fn report_failure(&self) {}

    /// Close the connection.
    async fn shutdown(self)
    where
        Self: Sized,
    {
    }
}

/// Creates connections on demand.
#[async_trait]
pub trait ConnectionFactory<C>: Send + Sync {
    async fn connect(&self) -> Result<C>;
}

struct PoolInner<C: Connection> {
    factory: Arc<dyn ConnectionFactory<C>>,
    idle: SegQueue<C>,
    created: AtomicU64,
    reused: AtomicU64,
    discarded: AtomicU64,
}

impl<C: Connection> PoolInner<C> {
    fn release(&self, conn: C) {
        let state = conn.state();
        if state.is_healthy() {
            debug!(connection = conn.id(), "Returned connection to pool");
            self.idle.push(conn);
        } else {
            debug!(connection = conn.id(), ?state, "Dropping unhealthy connection on release");
            self.discard(conn);
        }
    }

    fn discard(&self, conn: C) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
        counter!(names::CONNECTIONS_DISCARDED).increment(1);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(conn.shutdown());
            }
            Err(_) => drop(conn),
        }
    }

    fn take_healthy(&self) -> Option<C> {
        while let Some(conn) = self.idle.pop() {
            let state = conn.state();
            if state.is_healthy() {
                return Some(conn);
            }
            debug!(connection = conn.id(), ?state, "Discarded unhealthy connection from pool");
            self.discard(conn);
        }
        None
    }
}

/// A leased connection, returned to the pool when dropped.
pub struct PooledConnection<C: Connection> {
    conn: Option<C>,
    pool: Arc<PoolInner<C>>,
}

impl<C: Connection> PooledConnection<C> {
    /// Get a reference to the underlying connection.
    pub fn connection(&self) -> &C {
        self
    }
}

impl<C: Connection> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        match &self.conn {
            Some(conn) => conn,
            // Only emptied inside `drop`.
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<C: Connection> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

/// Concurrent pool of connections created by a [`ConnectionFactory`].
pub struct ConnectionPool<C: Connection> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connection> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connection> ConnectionPool<C> {
    pub fn new(factory: Arc<dyn ConnectionFactory<C>>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                factory,
                idle: SegQueue::new(),
                created: AtomicU64::new(0),
                reused: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
            }),
        }
    }

    /// Lease a healthy idle connection, or open a new one.
    ///
    /// Never waits on other leases. Fails only when the factory fails.
    pub async fn acquire(&self) -> Result<PooledConnection<C>> {
        if let Some(conn) = self.inner.take_healthy() {
            self.inner.reused.fetch_add(1, Ordering::Relaxed);
            debug!(connection = conn.id(), "Reused existing connection from pool");
            return Ok(self.lease(conn));
        }

        let conn = self.inner.factory.connect().await?;
        self.inner.created.fetch_add(1, Ordering::Relaxed);
        counter!(names::CONNECTIONS_CREATED).increment(1);
        debug!(connection = conn.id(), "Created new connection for pool");
        Ok(self.lease(conn))
    }

    /// Return a connection that was taken out of its guard.
    pub fn release(&self, conn: C) {
        self.inner.release(conn);
    }

    fn lease(&self, conn: C) -> PooledConnection<C> {
        PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
        }
    }

    /// Open up to `count` connections ahead of demand.
    pub async fn prewarm(&self, count: usize) -> usize {
        let mut opened = 0;
        for _ in 0..count {
            match self.inner.factory.connect().await {
                Ok(conn) => {
                    self.inner.created.fetch_add(1, Ordering::Relaxed);
                    self.inner.idle.push(conn);
                    opened += 1;
                }
                Err(e) => {
                    warn!("Failed to create connection during prewarm: {}", e);
                    break;
                }
            }
        }
        info!("Pre-warmed pool with {} connections", opened);
        opened
    }

    /// Shut down every idle connection.
    pub fn clear_idle(&self) -> usize {
        let mut cleared = 0;
        while let Some(conn) = self.inner.idle.pop() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(conn.shutdown());
                }
                Err(_) => drop(conn),
            }
            cleared += 1;
        }
        cleared
    }

    /// Get pool statistics.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle_connections: self.inner.idle.len(),
            created: self.inner.created.load(Ordering::Relaxed),
            reused: self.inner.reused.load(Ordering::Relaxed),
            discarded: self.inner.discarded.load(Ordering::Relaxed),
        }
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub idle_connections: usize,
    pub created: u64,
    pub reused: u64,
    pub discarded: u64,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pool: {} idle, {} created, {} reused, {} discarded",
            self.idle_connections, self.created, self.reused, self.discarded
        )
    }
}
