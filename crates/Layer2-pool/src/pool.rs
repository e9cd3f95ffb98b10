//! ConnectionPool - per-key bounded connection reuse
//!
//! Each key owns a FIFO semaphore sized `max_connections_per_key`. Holding
//! a permit is what makes a connection active, so waiters are served in
//! arrival order and the per-key limit holds across concurrent callers.
//! A second, global semaphore caps how many connections are being
//! established at once.

use crate::connection::{Connection, ConnectionState, PooledConnection};
use crate::factory::ConnectionFactory;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use xrun_foundation::{Error, PoolConfig, Result};

/// Point-in-time pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub keys: usize,
    pub idle: usize,
    pub active: usize,
    pub created: u64,
    pub reused: u64,
    pub evicted: u64,
    pub broken: u64,
}

struct KeySlot<H> {
    permits: Arc<Semaphore>,
    idle: VecDeque<Connection<H>>,
    active: usize,
}

impl<H> KeySlot<H> {
    fn new(max: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max)),
            idle: VecDeque::new(),
            active: 0,
        }
    }

    /// Nothing pooled, checked out or waiting
    ///
    /// Waiters and permit holders keep a clone of `permits`.
    fn is_unused(&self) -> bool {
        self.active == 0 && self.idle.is_empty() && Arc::strong_count(&self.permits) == 1
    }
}

/// Forget keys with nothing left in them
fn prune<K, H>(slots: &mut HashMap<K, KeySlot<H>>) -> usize {
    let before = slots.len();
    slots.retain(|_, slot| !slot.is_unused());
    before - slots.len()
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    reused: AtomicU64,
    evicted: AtomicU64,
    broken: AtomicU64,
}

pub(crate) struct PoolInner<F: ConnectionFactory> {
    factory: F,
    config: PoolConfig,
    slots: Mutex<HashMap<F::Key, KeySlot<F::Handle>>>,
    creates: Semaphore,
    closed: AtomicBool,
    next_id: AtomicU64,
    counters: Counters,
}

impl<F: ConnectionFactory> PoolInner<F> {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn permits_for(&self, key: &F::Key) -> Arc<Semaphore> {
        let max = self.config.max_connections_per_key.max(1);
        let mut slots = self.slots.lock();
        let slot = slots.entry(key.clone()).or_insert_with(|| KeySlot::new(max));
        Arc::clone(&slot.permits)
    }

    fn pop_idle(&self, key: &F::Key) -> Option<Connection<F::Handle>> {
        // most recently used first
        self.slots.lock().get_mut(key).and_then(|slot| slot.idle.pop_back())
    }

    fn mark_active(&self, key: &F::Key) {
        if let Some(slot) = self.slots.lock().get_mut(key) {
            slot.active += 1;
        }
    }

    /// Called from the guard's `Drop`, so it must not await
    pub(crate) fn checkin(self: &Arc<Self>, key: &F::Key, mut conn: Connection<F::Handle>) {
        let broken = conn.state() == ConnectionState::Broken;
        let discard = broken || self.is_closed();

        {
            let mut slots = self.slots.lock();
            if let Some(slot) = slots.get_mut(key) {
                slot.active = slot.active.saturating_sub(1);
                if !discard {
                    conn.checkin();
                    trace!(key = %key, id = conn.id(), "Connection returned to pool");
                    slot.idle.push_back(conn);
                    return;
                }
            }
        }

        if broken {
            self.counters.broken.fetch_add(1, Ordering::Relaxed);
        }
        debug!(key = %key, id = conn.id(), broken, "Discarding connection");
        self.close_detached(conn);
    }

    fn close_detached(self: &Arc<Self>, conn: Connection<F::Handle>) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let inner = Arc::clone(self);
                runtime.spawn(async move {
                    inner.factory.close(conn.into_handle()).await;
                });
            }
            // no runtime left to run an async close; dropping closes the socket
            Err(_) => drop(conn),
        }
    }
}

fn closed_error(key: &impl std::fmt::Display) -> Error {
    Error::connection(key.to_string(), "connection pool is closed")
}

/// Bounded pool of transport connections keyed by target identity
pub struct ConnectionPool<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> Clone for ConnectionPool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    /// Empty pool; connections open lazily on first `acquire`
    pub fn new(factory: F, config: PoolConfig) -> Self {
        let creates = Semaphore::new(config.max_concurrent_creates.max(1));
        Self {
            inner: Arc::new(PoolInner {
                factory,
                config,
                slots: Mutex::new(HashMap::new()),
                creates,
                closed: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                counters: Counters::default(),
            }),
        }
    }

    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Check out a connection for `key`
    ///
    /// Waits (FIFO) while the key is at `max_connections_per_key`. Idle
    /// connections are health-checked before reuse; unhealthy ones are closed
    /// and the next candidate is tried before a new connection is created.
    pub async fn acquire(&self, key: &F::Key) -> Result<PooledConnection<F>> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(closed_error(key));
        }

        let permits = inner.permits_for(key);
        let permit = match inner.config.acquire_timeout() {
            Some(limit) => tokio::time::timeout(limit, permits.acquire_owned())
                .await
                .map_err(|_| Error::timeout(format!("acquire connection to {}", key), limit))?,
            None => permits.acquire_owned().await,
        }
        .map_err(|_| closed_error(key))?;

        while let Some(mut conn) = inner.pop_idle(key) {
            if inner.factory.health_check(conn.handle()).await {
                conn.checkout();
                inner.mark_active(key);
                inner.counters.reused.fetch_add(1, Ordering::Relaxed);
                trace!(key = %key, id = conn.id(), uses = conn.use_count(), "Reusing connection");
                return Ok(PooledConnection::new(conn, key.clone(), Arc::clone(inner), permit));
            }
            inner.counters.broken.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, id = conn.id(), "Idle connection failed health check");
            inner.factory.close(conn.into_handle()).await;
        }

        let handle = {
            let _creating = inner.creates.acquire().await.map_err(|_| closed_error(key))?;
            inner.factory.connect(key).await?
        };

        if inner.is_closed() {
            inner.factory.close(handle).await;
            return Err(closed_error(key));
        }

        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut conn = Connection::new(id, handle);
        conn.checkout();
        inner.mark_active(key);
        inner.counters.created.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, id, "Opened connection");
        Ok(PooledConnection::new(conn, key.clone(), Arc::clone(inner), permit))
    }

    /// Run the factory's health check against a checked-out connection
    pub async fn health_check(&self, conn: &PooledConnection<F>) -> bool {
        self.inner.factory.health_check(&**conn).await
    }

    /// Close idle connections unused for at least `max_idle`
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let evicted: Vec<Connection<F::Handle>> = {
            let mut slots = self.inner.slots.lock();
            let mut evicted = Vec::new();
            for slot in slots.values_mut() {
                let (stale, fresh): (VecDeque<_>, VecDeque<_>) =
                    slot.idle.drain(..).partition(|c| c.idle_for() >= max_idle);
                slot.idle = fresh;
                evicted.extend(stale);
            }
            let pruned = prune(&mut slots);
            if pruned > 0 {
                trace!(pruned, "Dropped unused pool keys");
            }
            evicted
        };

        let count = evicted.len();
        if count > 0 {
            debug!(count, "Evicting idle connections");
            self.inner
                .counters
                .evicted
                .fetch_add(count as u64, Ordering::Relaxed);
        }
        for conn in evicted {
            self.inner.factory.close(conn.into_handle()).await;
        }
        count
    }

    /// Every `interval`, evict connections idle for at least `max_idle`
    ///
    /// The task holds only a weak reference and stops once the pool is
    /// dropped or closed. Must be called inside a tokio runtime.
    pub fn spawn_reaper(&self, interval: Duration, max_idle: Duration) -> JoinHandle<()> {
        let weak: Weak<PoolInner<F>> = Arc::downgrade(&self.inner);
        let period = interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if inner.is_closed() {
                    break;
                }
                ConnectionPool { inner }.evict_idle(max_idle).await;
            }
            trace!("Pool reaper stopped");
        })
    }

    /// Close every idle connection and refuse further acquisitions
    ///
    /// Checked-out connections are closed when their guards drop.
    /// Callers waiting for capacity fail with a connection error.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.creates.close();

        let drained: Vec<Connection<F::Handle>> = {
            let mut slots = self.inner.slots.lock();
            let mut drained = Vec::new();
            for slot in slots.values_mut() {
                slot.permits.close();
                drained.extend(slot.idle.drain(..));
            }
            prune(&mut slots);
            drained
        };

        if !drained.is_empty() {
            debug!(count = drained.len(), "Closing pooled connections");
        }
        for conn in drained {
            self.inner.factory.close(conn.into_handle()).await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn active_count(&self, key: &F::Key) -> usize {
        self.inner.slots.lock().get(key).map(|s| s.active).unwrap_or(0)
    }

    pub fn idle_count(&self, key: &F::Key) -> usize {
        self.inner.slots.lock().get(key).map(|s| s.idle.len()).unwrap_or(0)
    }

    /// Point-in-time counters. `keys` counts targets with live slots.
    pub fn stats(&self) -> PoolStats {
        let slots = self.inner.slots.lock();
        let counters = &self.inner.counters;
        PoolStats {
            keys: slots.len(),
            idle: slots.values().map(|s| s.idle.len()).sum(),
            active: slots.values().map(|s| s.active).sum(),
            created: counters.created.load(Ordering::Relaxed),
            reused: counters.reused.load(Ordering::Relaxed),
            evicted: counters.evicted.load(Ordering::Relaxed),
            broken: counters.broken.load(Ordering::Relaxed),
        }
    }
}

impl<F: ConnectionFactory> Drop for PoolInner<F> {
    fn drop(&mut self) {
        let idle: usize = self.slots.get_mut().values().map(|s| s.idle.len()).sum();
        if idle > 0 && !self.is_closed() {
            warn!(idle, "Connection pool dropped without close()");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingFactory {
        connects: AtomicUsize,
        closes: AtomicUsize,
        unhealthy: AtomicBool,
    }

    #[async_trait]
    impl ConnectionFactory for Arc<CountingFactory> {
        type Key = String;
        type Handle = usize;

        async fn connect(&self, _key: &String) -> Result<usize> {
            Ok(self.connects.fetch_add(1, Ordering::SeqCst))
        }

        async fn health_check(&self, _handle: &usize) -> bool {
            !self.unhealthy.load(Ordering::SeqCst)
        }

        async fn close(&self, _handle: usize) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pool() -> (ConnectionPool<Arc<CountingFactory>>, Arc<CountingFactory>) {
        let factory = Arc::new(CountingFactory::default());
        (ConnectionPool::new(Arc::clone(&factory), PoolConfig::default()), factory)
    }

    #[tokio::test]
    async fn test_released_connection_is_reused() {
        let (pool, factory) = pool();
        let key = "ssh://deploy@web-1:22".to_string();

        let first = pool.acquire(&key).await.unwrap();
        let id = first.id();
        assert_eq!(pool.active_count(&key), 1);
        first.release();
        assert_eq!(pool.idle_count(&key), 1);

        let second = pool.acquire(&key).await.unwrap();
        assert_eq!(second.id(), id);
        assert_eq!(second.use_count(), 2);
        assert_eq!(factory.connects.load(Ordering::SeqCst), 1);

        let stats = pool.stats();
        assert_eq!((stats.created, stats.reused, stats.active), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_broken_connection_discarded() {
        let (pool, factory) = pool();
        let key = "k".to_string();

        let mut conn = pool.acquire(&key).await.unwrap();
        let id = conn.id();
        conn.mark_broken();
        drop(conn);
        assert_eq!(pool.idle_count(&key), 0);
        assert_eq!(pool.stats().broken, 1);

        let fresh = pool.acquire(&key).await.unwrap();
        assert_ne!(fresh.id(), id);
        assert_eq!(factory.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unhealthy_idle_connection_replaced() {
        let (pool, factory) = pool();
        let key = "k".to_string();

        pool.acquire(&key).await.unwrap().release();
        factory.unhealthy.store(true, Ordering::SeqCst);

        let conn = pool.acquire(&key).await.unwrap();
        assert_eq!(factory.connects.load(Ordering::SeqCst), 2);
        assert_eq!(factory.closes.load(Ordering::SeqCst), 1);
        assert_eq!(conn.use_count(), 1);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (pool, _) = pool();
        let a = pool.acquire(&"a".to_string()).await.unwrap();
        let b = pool.acquire(&"b".to_string()).await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(pool.stats().keys, 2);
    }

    #[tokio::test]
    async fn test_evict_idle() {
        let (pool, factory) = pool();
        let key = "k".to_string();
        pool.acquire(&key).await.unwrap().release();

        assert_eq!(pool.evict_idle(Duration::from_secs(60)).await, 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.evict_idle(Duration::from_millis(10)).await, 1);
        assert_eq!(pool.idle_count(&key), 0);
        assert_eq!(factory.closes.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().evicted, 1);
    }

    #[tokio::test]
    async fn test_unused_keys_are_pruned() {
        let (pool, _) = pool();
        for host in ["a", "b", "c"] {
            pool.acquire(&host.to_string()).await.unwrap().release();
        }
        let held = pool.acquire(&"d".to_string()).await.unwrap();
        assert_eq!(pool.stats().keys, 4);

        assert_eq!(pool.evict_idle(Duration::ZERO).await, 3);
        assert_eq!(pool.stats().keys, 1);
        assert_eq!(pool.active_count(&"d".to_string()), 1);

        drop(held);
        pool.close().await;
        assert_eq!(pool.stats().keys, 0);
    }

    #[tokio::test]
    async fn test_close_rejects_acquire() {
        let (pool, factory) = pool();
        let key = "k".to_string();
        pool.acquire(&key).await.unwrap().release();

        pool.close().await;
        assert!(pool.is_closed());
        assert_eq!(factory.closes.load(Ordering::SeqCst), 1);

        let err = pool.acquire(&key).await.unwrap_err();
        assert!(matches!(err, Error::Connection { .. }));
    }
}
