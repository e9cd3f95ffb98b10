//! Pooled connection records and the checkout guard

use crate::factory::ConnectionFactory;
use crate::pool::PoolInner;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OwnedSemaphorePermit;

/// Lifecycle of a pooled connection
///
/// `Broken` connections are closed on checkin instead of returning to the
/// idle list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Active,
    Broken,
}

/// A live transport handle plus bookkeeping
#[derive(Debug)]
pub struct Connection<H> {
    id: u64,
    handle: H,
    state: ConnectionState,
    created_at: Instant,
    last_used: Instant,
    use_count: u64,
}

impl<H> Connection<H> {
    pub(crate) fn new(id: u64, handle: H) -> Self {
        let now = Instant::now();
        Self {
            id,
            handle,
            state: ConnectionState::Active,
            created_at: now,
            last_used: now,
            use_count: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since the last checkin, or since creation if never used
    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub fn use_count(&self) -> u64 {
        self.use_count
    }

    pub(crate) fn checkout(&mut self) {
        self.state = ConnectionState::Active;
        self.use_count += 1;
    }

    pub(crate) fn checkin(&mut self) {
        self.state = ConnectionState::Idle;
        self.last_used = Instant::now();
    }

    pub(crate) fn into_handle(self) -> H {
        self.handle
    }
}

/// Exclusive checkout of a pooled connection
///
/// Dropping the guard returns the connection to its key's idle list, or
/// closes it when it was marked broken or the pool has been closed. The per-key
/// permit is released only after the connection is back in the idle list, so
/// the next waiter finds it there.
pub struct PooledConnection<F: ConnectionFactory> {
    conn: Option<Connection<F::Handle>>,
    key: F::Key,
    pool: Arc<PoolInner<F>>,
    _permit: OwnedSemaphorePermit,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    pub(crate) fn new(
        conn: Connection<F::Handle>,
        key: F::Key,
        pool: Arc<PoolInner<F>>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            conn: Some(conn),
            key,
            pool,
            _permit: permit,
        }
    }

    pub fn id(&self) -> u64 {
        self.conn.as_ref().map(|c| c.id).unwrap_or_default()
    }

    pub fn key(&self) -> &F::Key {
        &self.key
    }

    /// Number of checkouts, this one included
    pub fn use_count(&self) -> u64 {
        self.conn.as_ref().map(|c| c.use_count).unwrap_or_default()
    }

    /// Discard instead of returning to the pool on release
    pub fn mark_broken(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.state = ConnectionState::Broken;
        }
    }

    /// Set by `mark_broken()`; decides between checkin and close on drop
    pub fn is_broken(&self) -> bool {
        self.conn
            .as_ref()
            .map(|c| c.state == ConnectionState::Broken)
            .unwrap_or(true)
    }

    /// Return the connection now
    pub fn release(self) {
        drop(self);
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<F> {
    type Target = F::Handle;

    fn deref(&self) -> &F::Handle {
        // Only `Drop` takes the connection out
        match self.conn.as_ref() {
            Some(conn) => &conn.handle,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for PooledConnection<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id())
            .field("key", &self.key)
            .field("broken", &self.is_broken())
            .finish()
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.checkin(&self.key, conn);
        }
    }
}
