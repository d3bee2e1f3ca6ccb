//! Bounded connection pool.
//!
//! At most `max` connections exist. `acquire` creates a new connection while
//! below the bound, then hands out idle ones round-robin. Each checkout holds
//! a semaphore permit, so a full pool makes `acquire` wait up to the acquire
//! timeout and then fail with [`PoolError::AcquireTimeout`]; callers treat that
//! as non-fatal and go direct.
//!
//! ```text
//!   acquire ──► permit (≤ max, bounded wait)
//!                 │
//!                 ├─ created < max ──► create, mark in use
//!                 └─ else ───────────► next idle slot after cursor
//!
//!   drop / release ──► slot idle, permit returned
//! ```

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("no connection available after {waited_ms} ms")]
    AcquireTimeout { waited_ms: u64 },

    #[error("connection pool closed")]
    Closed,

    #[error("failed to create connection: {0}")]
    Create(String),
}

/// Occupancy report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolHealth {
    pub max: usize,
    pub created: usize,
    pub idle: usize,
    pub in_use: usize,
}

type Factory<C> = Box<dyn Fn() -> Result<C, PoolError> + Send + Sync>;

struct Slots<C> {
    conns: Vec<Arc<C>>,
    in_use: Vec<bool>,
    cursor: usize,
}

struct PoolInner<C> {
    max: usize,
    acquire_timeout: Duration,
    semaphore: Arc<Semaphore>,
    slots: Mutex<Slots<C>>,
    factory: Factory<C>,
}

/// A pool of at most `max` connections of type `C`.
pub struct ConnectionPool<C> {
    inner: Arc<PoolInner<C>>,
}

impl<C> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        ConnectionPool {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Send + Sync + 'static> ConnectionPool<C> {
    pub fn new<F>(max: usize, acquire_timeout: Duration, factory: F) -> Self
    where
        F: Fn() -> Result<C, PoolError> + Send + Sync + 'static,
    {
        let max = max.max(1);
        ConnectionPool {
            inner: Arc::new(PoolInner {
                max,
                acquire_timeout,
                semaphore: Arc::new(Semaphore::new(max)),
                slots: Mutex::new(Slots {
                    conns: Vec::with_capacity(max),
                    in_use: Vec::with_capacity(max),
                    cursor: 0,
                }),
                factory: Box::new(factory),
            }),
        }
    }

    /// Checks out a connection, waiting at most the acquire timeout.
    pub async fn acquire(&self) -> Result<PooledConnection<C>, PoolError> {
        let inner = &self.inner;
        let permit = tokio::time::timeout(
            inner.acquire_timeout,
            Arc::clone(&inner.semaphore).acquire_owned(),
        )
        .await
        .map_err(|_| PoolError::AcquireTimeout {
            waited_ms: inner.acquire_timeout.as_millis() as u64,
        })?
        .map_err(|_| PoolError::Closed)?;

        let mut slots = inner.slots.lock();

        let index = if slots.conns.len() < inner.max {
            let conn = (inner.factory)()?;
            slots.conns.push(Arc::new(conn));
            slots.in_use.push(true);
            debug!(created = slots.conns.len(), max = inner.max, "Pool connection created");
            slots.conns.len() - 1
        } else {
            // The permit guarantees at least one idle slot.
            let len = slots.conns.len();
            let start = slots.cursor;
            let index = (0..len)
                .map(|offset| (start + offset) % len)
                .find(|&i| !slots.in_use[i])
                .ok_or(PoolError::Closed)?;
            slots.in_use[index] = true;
            slots.cursor = (index + 1) % len;
            index
        };

        let conn = Arc::clone(&slots.conns[index]);
        drop(slots);

        Ok(PooledConnection {
            conn,
            index,
            permit: Some(permit),
            pool: Arc::clone(&self.inner),
        })
    }

    pub fn health(&self) -> PoolHealth {
        let slots = self.inner.slots.lock();
        let in_use = slots.in_use.iter().filter(|used| **used).count();
        PoolHealth {
            max: self.inner.max,
            created: slots.conns.len(),
            idle: slots.conns.len() - in_use,
            in_use,
        }
    }
}

/// A checked-out connection. Returned to the pool on drop or [`release`].
///
/// [`release`]: PooledConnection::release
pub struct PooledConnection<C> {
    conn: Arc<C>,
    index: usize,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolInner<C>>,
}

impl<C> PooledConnection<C> {
    /// Slot index, for logging.
    pub fn slot(&self) -> usize {
        self.index
    }

    /// Returns the connection to the pool.
    pub fn release(self) {
        drop(self);
    }
}

impl<C> fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("slot", &self.index)
            .finish_non_exhaustive()
    }
}

impl<C> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

impl<C> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.pool.slots.lock().in_use[self.index] = false;
            drop(permit);
        }
    }
}
