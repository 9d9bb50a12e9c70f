//! A fixed-size async connection pool.
//!
//! Checkout waits on a semaphore for at most the checkout timeout. The
//! returned guard hands the connection back on `Drop`, so a connection is
//! never leaked by an early return, an error or a cancelled task.

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Semaphore, SemaphorePermit};

use super::StoreError;

/// Pool of `C` handles (cheaply cloneable connection objects).
#[derive(Debug)]
pub struct ConnectionPool<C> {
    idle: Mutex<Vec<C>>,
    permits: Semaphore,
    size: usize,
    checkout_timeout: Duration,
}

impl<C: Clone> ConnectionPool<C> {
    /// Creates a pool over already-opened connections.
    pub fn new(connections: Vec<C>, checkout_timeout: Duration) -> Self {
        let size = connections.len();
        Self {
            idle: Mutex::new(connections),
            permits: Semaphore::new(size),
            size,
            checkout_timeout,
        }
    }

    /// Checks out a connection.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::PoolTimeout` when no connection frees up within
    /// the checkout timeout.
    pub async fn get(&self) -> Result<PooledConnection<'_, C>, StoreError> {
        let permit = tokio::time::timeout(self.checkout_timeout, self.permits.acquire())
            .await
            .map_err(|_| StoreError::PoolTimeout(self.checkout_timeout))?
            .map_err(|_| StoreError::Unavailable("connection pool is closed".to_string()))?;

        let conn = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .ok_or_else(|| StoreError::Unavailable("connection pool is empty".to_string()))?;

        Ok(PooledConnection {
            conn,
            pool: self,
            _permit: permit,
        })
    }

    /// Total number of connections.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Connections not currently checked out.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    fn give_back(&self, conn: C) {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(conn);
    }
}

/// A checked-out connection.
pub struct PooledConnection<'a, C: Clone> {
    conn: C,
    pool: &'a ConnectionPool<C>,
    // Released after `drop` has returned the connection.
    _permit: SemaphorePermit<'a>,
}

impl<C: Clone> Deref for PooledConnection<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

impl<C: Clone> DerefMut for PooledConnection<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.conn
    }
}

impl<C: Clone> Drop for PooledConnection<'_, C> {
    fn drop(&mut self) {
        self.pool.give_back(self.conn.clone());
    }
}
