//! Per-host connection cache.
//!
//! Each host gets its own small pool, created lazily on first use. Capacity
//! is enforced with a semaphore, so a saturated pool makes callers wait up to
//! the acquire timeout and then fail instead of opening unbounded connections
//! to a remote instance.
//!
//! A borrowed connection is returned with [`PooledConnection::release`] only
//! when every operation on it succeeded; otherwise the borrower calls
//! [`PooledConnection::discard`]. Dropping the guard without either discards.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::postgres::{Catalog, ConnectionInfo, Connector};
use crate::{Error, Result};

struct HostPool<T> {
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<T>>,
    closed: AtomicBool,
}

impl<T> HostPool<T> {
    fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            idle: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn idle(&self) -> MutexGuard<'_, Vec<T>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Connection pools keyed by host address, scoped to one run.
pub struct ConnectionCache<C: Connector> {
    connector: C,
    capacity: usize,
    acquire_timeout: Duration,
    pools: Mutex<HashMap<String, Arc<HostPool<C::Conn>>>>,
    closed: AtomicBool,
}

impl<C: Connector> ConnectionCache<C> {
    pub fn new(connector: C, capacity: usize, acquire_timeout: Duration) -> Self {
        Self {
            connector,
            capacity: capacity.max(1),
            acquire_timeout,
            pools: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn pool_for(&self, host: &str) -> Result<Arc<HostPool<C::Conn>>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::PoolClosed {
                host: host.to_string(),
            });
        }
        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        let pool = pools
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(HostPool::new(self.capacity)));
        Ok(Arc::clone(pool))
    }

    /// Borrows a connection to `host`, reusing an idle live one when possible.
    ///
    /// `credentials` are only used when a new connection must be opened; the
    /// host in them is overridden by `host`.
    pub async fn acquire(
        &self,
        host: &str,
        credentials: &ConnectionInfo,
    ) -> Result<PooledConnection<C::Conn>> {
        let pool = self.pool_for(host)?;

        let permit = tokio::time::timeout(
            self.acquire_timeout,
            Arc::clone(&pool.permits).acquire_owned(),
        )
        .await
        .map_err(|_| Error::Timeout {
            message: format!(
                "no connection to {} available within {:?}",
                host, self.acquire_timeout
            ),
        })?
        .map_err(|_| Error::PoolClosed {
            host: host.to_string(),
        })?;

        let reused = {
            let mut idle = pool.idle();
            let mut found = None;
            while let Some(conn) = idle.pop() {
                if conn.is_alive() {
                    found = Some(conn);
                    break;
                }
                debug!(host = %host, "Dropping dead idle connection");
            }
            found
        };

        let conn = match reused {
            Some(conn) => {
                debug!(host = %host, "Reusing pooled connection");
                conn
            }
            None => self.connector.connect(&credentials.for_host(host)).await?,
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool,
            host: host.to_string(),
            _permit: permit,
        })
    }

    /// Closes every pooled connection and refuses further acquires.
    ///
    /// Returns the number of idle connections that were closed. Connections
    /// still borrowed are closed when their guard is released or dropped.
    pub fn shutdown(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let pools: Vec<(String, Arc<HostPool<C::Conn>>)> = self
            .pools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();

        let mut closed = 0;
        for (host, pool) in pools {
            pool.closed.store(true, Ordering::SeqCst);
            pool.permits.close();
            let idle: Vec<C::Conn> = pool.idle().drain(..).collect();
            debug!(host = %host, connections = idle.len(), "Closing connection pool");
            closed += idle.len();
        }

        info!(connections = closed, "Connection cache shut down");
        closed
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl<C: Connector> Drop for ConnectionCache<C> {
    fn drop(&mut self) {
        if !self.is_closed() {
            warn!("Connection cache dropped without shutdown; closing pools");
            self.shutdown();
        }
    }
}

/// A connection borrowed from a [`ConnectionCache`].
pub struct PooledConnection<T> {
    conn: Option<T>,
    pool: Arc<HostPool<T>>,
    host: String,
    _permit: OwnedSemaphorePermit,
}

impl<T: Catalog> PooledConnection<T> {
    /// Returns the connection to its pool for reuse.
    pub fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            if conn.is_alive() && !self.pool.closed.load(Ordering::SeqCst) {
                self.pool.idle().push(conn);
            } else {
                debug!(host = %self.host, "Not returning closed connection to pool");
            }
        }
    }

    /// Closes the connection instead of returning it.
    pub fn discard(mut self) {
        if self.conn.take().is_some() {
            debug!(host = %self.host, "Discarding connection");
        }
    }
}

impl<T> Deref for PooledConnection<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.conn
            .as_ref()
            .expect("connection is present until release or discard")
    }
}

impl<T> Drop for PooledConnection<T> {
    fn drop(&mut self) {
        if self.conn.take().is_some() {
            debug!(host = %self.host, "Borrowed connection dropped without release; discarding");
        }
    }
}
