//! Upstream connection pool keyed by [`PoolKey`].
//!
//! Each key owns an idle queue of exclusive connections (HTTP/1.1), an
//! optional shared handle (HTTP/2) and an async lock that serializes
//! establishment so concurrent requests for one key do not race to open
//! parallel tunnels.
//!
//! # Performance
//!
//! Key lookup goes through `DashMap` and clones the entry `Arc` out before
//! any await, so no shard lock is held across I/O. Idle queues use
//! `parking_lot` mutexes held only for push/pop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, trace};

use burrow_common::ClusterId;
use burrow_config::ConnectionPoolConfig;

use crate::pool_key::PoolKey;

/// A connection handle the pool can hold
pub trait Poolable: Send + 'static {
    /// Whether the underlying connection can still carry requests
    fn is_open(&self) -> bool;

    /// A second handle to the same connection if it multiplexes requests
    fn share(&self) -> Option<Self>
    where
        Self: Sized;
}

/// Pool limits
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Idle connections kept per key
    pub max_idle_per_key: usize,
    /// Idle connections older than this are dropped on checkout
    pub idle_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from(&ConnectionPoolConfig::default())
    }
}

impl From<&ConnectionPoolConfig> for PoolSettings {
    fn from(config: &ConnectionPoolConfig) -> Self {
        Self {
            max_idle_per_key: config.max_idle,
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
        }
    }
}

/// Snapshot of pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// New connections opened
    pub connections_created: u64,
    /// Requests served by an existing connection
    pub connections_reused: u64,
    /// Tunnels that reached `Established`
    pub tunnels_established: u64,
    /// Tunnel negotiations that failed
    pub tunnel_failures: u64,
    /// Connections dropped because they closed or expired
    pub evicted: u64,
}

#[derive(Debug, Default)]
struct Counters {
    created: AtomicU64,
    reused: AtomicU64,
    tunnels_established: AtomicU64,
    tunnel_failures: AtomicU64,
    evicted: AtomicU64,
}

struct IdleConnection<T> {
    conn: T,
    idle_since: Instant,
}

struct KeyEntry<T> {
    idle: Mutex<VecDeque<IdleConnection<T>>>,
    shared: Mutex<Option<T>>,
    connect_lock: Arc<AsyncMutex<()>>,
}

impl<T> KeyEntry<T> {
    fn new() -> Self {
        Self {
            idle: Mutex::new(VecDeque::new()),
            shared: Mutex::new(None),
            connect_lock: Arc::new(AsyncMutex::new(())),
        }
    }
}

/// Connection pool for a single cluster
pub struct ConnectionPool<T> {
    cluster: ClusterId,
    settings: PoolSettings,
    entries: DashMap<PoolKey, Arc<KeyEntry<T>>>,
    counters: Counters,
}

impl<T: Poolable> ConnectionPool<T> {
    pub fn new(cluster: ClusterId, settings: PoolSettings) -> Self {
        Self {
            cluster,
            settings,
            entries: DashMap::new(),
            counters: Counters::default(),
        }
    }

    fn entry(&self, key: &PoolKey) -> Arc<KeyEntry<T>> {
        if let Some(entry) = self.entries.get(key) {
            return Arc::clone(entry.value());
        }
        Arc::clone(
            self.entries
                .entry(key.clone())
                .or_insert_with(|| Arc::new(KeyEntry::new()))
                .value(),
        )
    }

    /// Take a ready connection for `key`, if one exists.
    ///
    /// A shared handle is preferred. Closed or expired connections found
    /// along the way are evicted.
    pub fn checkout(&self, key: &PoolKey) -> Option<T> {
        let entry = self.entries.get(key).map(|e| Arc::clone(e.value()))?;

        {
            let mut shared = entry.shared.lock();
            match shared.as_ref().map(Poolable::is_open) {
                Some(true) => {
                    if let Some(handle) = shared.as_ref().and_then(Poolable::share) {
                        self.counters.reused.fetch_add(1, Ordering::Relaxed);
                        trace!(cluster = %self.cluster, pool_key = %key, "Reusing shared connection");
                        return Some(handle);
                    }
                }
                Some(false) => {
                    *shared = None;
                    self.counters.evicted.fetch_add(1, Ordering::Relaxed);
                    debug!(cluster = %self.cluster, pool_key = %key, "Evicted closed shared connection");
                }
                None => {}
            }
        }

        let mut idle = entry.idle.lock();
        while let Some(candidate) = idle.pop_back() {
            if !candidate.conn.is_open()
                || candidate.idle_since.elapsed() >= self.settings.idle_timeout
            {
                self.counters.evicted.fetch_add(1, Ordering::Relaxed);
                debug!(cluster = %self.cluster, pool_key = %key, "Evicted stale idle connection");
                continue;
            }
            self.counters.reused.fetch_add(1, Ordering::Relaxed);
            trace!(
                cluster = %self.cluster,
                pool_key = %key,
                remaining_idle = idle.len(),
                "Reusing idle connection"
            );
            return Some(candidate.conn);
        }
        None
    }

    /// Acquire the establishment lock for `key`.
    ///
    /// Callers re-check [`checkout`](Self::checkout) after the lock is held.
    pub async fn lock_key(&self, key: &PoolKey) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(&self.entry(key).connect_lock);
        lock.lock_owned().await
    }

    /// Register a multiplexed connection as the shared handle for `key`
    pub fn set_shared(&self, key: &PoolKey, conn: T) {
        if !conn.is_open() {
            return;
        }
        let entry = self.entry(key);
        let previous = entry.shared.lock().replace(conn);
        if previous.is_some() {
            trace!(cluster = %self.cluster, pool_key = %key, "Replaced shared connection");
        }
    }

    /// Return an exclusive connection to the idle queue
    pub fn release(&self, key: &PoolKey, conn: T) {
        if !conn.is_open() {
            self.counters.evicted.fetch_add(1, Ordering::Relaxed);
            debug!(cluster = %self.cluster, pool_key = %key, "Dropping closed connection on release");
            return;
        }

        let entry = self.entry(key);
        let mut idle = entry.idle.lock();
        if idle.len() >= self.settings.max_idle_per_key {
            trace!(cluster = %self.cluster, pool_key = %key, "Idle queue full, closing connection");
            return;
        }
        idle.push_back(IdleConnection {
            conn,
            idle_since: Instant::now(),
        });
        trace!(cluster = %self.cluster, pool_key = %key, idle = idle.len(), "Connection returned to pool");
    }

    /// Idle exclusive connections currently held for `key`
    pub fn idle_count(&self, key: &PoolKey) -> usize {
        self.entries
            .get(key)
            .map(|e| e.idle.lock().len())
            .unwrap_or(0)
    }

    /// Whether a shared handle is held for `key`
    pub fn has_shared(&self, key: &PoolKey) -> bool {
        self.entries
            .get(key)
            .map(|e| e.shared.lock().is_some())
            .unwrap_or(false)
    }

    /// Drop closed and expired connections across all keys. Returns how many.
    pub fn evict_closed(&self) -> usize {
        let mut evicted = 0;
        for entry in self.entries.iter() {
            {
                let mut shared = entry.shared.lock();
                if shared.as_ref().is_some_and(|c| !c.is_open()) {
                    *shared = None;
                    evicted += 1;
                }
            }
            let mut idle = entry.idle.lock();
            let before = idle.len();
            idle.retain(|c| c.conn.is_open() && c.idle_since.elapsed() < self.settings.idle_timeout);
            evicted += before - idle.len();
        }

        // Keys with nothing pooled and no outside holder can go. An outside
        // holder may be establishing or about to release into the entry.
        self.entries.retain(|_, entry| {
            Arc::strong_count(entry) > 1
                || Arc::strong_count(&entry.connect_lock) > 1
                || entry.shared.lock().is_some()
                || !entry.idle.lock().is_empty()
        });

        if evicted > 0 {
            self.counters
                .evicted
                .fetch_add(evicted as u64, Ordering::Relaxed);
            debug!(cluster = %self.cluster, evicted, "Evicted closed upstream connections");
        }
        evicted
    }

    pub fn record_created(&self) {
        self.counters.created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tunnel_established(&self) {
        self.counters
            .tunnels_established
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tunnel_failure(&self) {
        self.counters.tunnel_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            connections_created: self.counters.created.load(Ordering::Relaxed),
            connections_reused: self.counters.reused.load(Ordering::Relaxed),
            tunnels_established: self.counters.tunnels_established.load(Ordering::Relaxed),
            tunnel_failures: self.counters.tunnel_failures.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
        }
    }
}
