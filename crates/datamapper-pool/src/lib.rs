//! Connection pooling for datamapper using asupersync.
//!
//! One [`Pool`] serves one connection string. Connections come from a
//! [`ConnectionFactory`], are handed out as [`PooledConnection`] guards and
//! go back to the idle list when the guard drops.
//!
//! When every slot is in use, [`Pool::acquire`] suspends until a guard comes
//! back or `acquire_timeout_ms` passes. A zero timeout turns waiting off and
//! reports `PoolErrorKind::Exhausted` at once.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use asupersync::time::sleep;
use asupersync::{Cx, Outcome};
use datamapper_core::{Connection, ConnectionFactory, Error, PoolError, PoolErrorKind};
use serde::Deserialize;

/// Connection pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Connections opened by [`Pool::warm_up`]
    pub min_connections: usize,
    /// Maximum number of connections allowed
    pub max_connections: usize,
    /// How long [`Pool::acquire`] waits for a busy pool; zero fails fast
    pub acquire_timeout_ms: u64,
    /// Idle connections older than this are closed instead of reused
    pub idle_timeout_ms: u64,
    /// Connections older than this are closed instead of reused
    pub max_lifetime_ms: u64,
    /// Ping connections before giving them out
    pub test_on_checkout: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 10,
            acquire_timeout_ms: 30_000, // 30 seconds
            idle_timeout_ms: 600_000,   // 10 minutes
            max_lifetime_ms: 1_800_000, // 30 minutes
            test_on_checkout: true,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with the given max connections.
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            ..Default::default()
        }
    }

    /// Set minimum connections.
    pub fn min_connections(mut self, n: usize) -> Self {
        self.min_connections = n;
        self
    }

    /// Set acquire timeout.
    pub fn acquire_timeout(mut self, ms: u64) -> Self {
        self.acquire_timeout_ms = ms;
        self
    }

    /// Set idle timeout.
    pub fn idle_timeout(mut self, ms: u64) -> Self {
        self.idle_timeout_ms = ms;
        self
    }

    /// Set max lifetime.
    pub fn max_lifetime(mut self, ms: u64) -> Self {
        self.max_lifetime_ms = ms;
        self
    }

    /// Enable/disable test on checkout.
    pub fn test_on_checkout(mut self, enabled: bool) -> Self {
        self.test_on_checkout = enabled;
        self
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total number of connections (active + idle)
    pub total_connections: usize,
    /// Number of idle connections
    pub idle_connections: usize,
    /// Number of active connections
    pub active_connections: usize,
    /// Physical connections opened over the pool's lifetime
    pub connections_created: u64,
    /// Successful acquisitions over the pool's lifetime
    pub acquisitions: u64,
}

/// Upper bound on one sleep while waiting for a busy pool.
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(5);

struct IdleConnection<C> {
    conn: C,
    created_at: Instant,
    idle_since: Instant,
}

struct PoolInner<F: ConnectionFactory> {
    factory: F,
    connection_string: String,
    config: PoolConfig,
    idle: Mutex<Vec<IdleConnection<F::Connection>>>,
    total: AtomicUsize,
    created: AtomicU64,
    acquisitions: AtomicU64,
    closed: AtomicBool,
}

impl<F: ConnectionFactory> PoolInner<F> {
    fn idle(&self) -> std::sync::MutexGuard<'_, Vec<IdleConnection<F::Connection>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn expired(&self, entry: &IdleConnection<F::Connection>, now: Instant) -> bool {
        now.duration_since(entry.created_at) >= Duration::from_millis(self.config.max_lifetime_ms)
            || now.duration_since(entry.idle_since)
                >= Duration::from_millis(self.config.idle_timeout_ms)
    }

    /// Reserve a slot for a new connection, failing when the pool is full.
    fn reserve(&self) -> bool {
        self.total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.config.max_connections).then_some(n + 1)
            })
            .is_ok()
    }

    fn release_slot(&self) {
        self.total.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A pool of connections for one connection string.
///
/// Cloning is cheap; clones share the same connections.
pub struct Pool<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for Pool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("connection_string", &self.inner.connection_string)
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<F: ConnectionFactory> Pool<F> {
    /// Create a new connection pool. No connection is opened until first use.
    pub fn new(factory: F, connection_string: impl Into<String>, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                factory,
                connection_string: connection_string.into(),
                config,
                idle: Mutex::new(Vec::new()),
                total: AtomicUsize::new(0),
                created: AtomicU64::new(0),
                acquisitions: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Get the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn connection_string(&self) -> &str {
        &self.inner.connection_string
    }

    /// Get the current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let total = self.inner.total.load(Ordering::Acquire);
        let idle = self.inner.idle().len();
        PoolStats {
            total_connections: total,
            idle_connections: idle,
            active_connections: total.saturating_sub(idle),
            connections_created: self.inner.created.load(Ordering::Relaxed),
            acquisitions: self.inner.acquisitions.load(Ordering::Relaxed),
        }
    }

    /// Check if the pool is at capacity.
    pub fn at_capacity(&self) -> bool {
        self.inner.total.load(Ordering::Acquire) >= self.inner.config.max_connections
    }

    /// Borrow a connection, reusing an idle one when possible.
    ///
    /// A full pool is polled until a connection is returned, the acquire
    /// timeout passes, or `cx` is cancelled.
    #[tracing::instrument(level = "trace", skip_all, fields(pool = %self.inner.connection_string))]
    pub async fn acquire(&self, cx: &Cx) -> Outcome<PooledConnection<F>, Error> {
        let timeout = Duration::from_millis(self.inner.config.acquire_timeout_ms);
        let started = Instant::now();
        let mut waited = false;
        loop {
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
            if self.inner.closed.load(Ordering::Acquire) {
                return Outcome::Err(pool_error(PoolErrorKind::Closed, "pool is closed"));
            }
            match self.try_acquire(cx).await {
                Outcome::Ok(Some(conn)) => {
                    if waited {
                        tracing::trace!(
                            waited = ?started.elapsed(),
                            "acquired connection after waiting"
                        );
                    }
                    return Outcome::Ok(conn);
                }
                Outcome::Ok(None) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }

            let max = self.inner.config.max_connections;
            if timeout.is_zero() {
                tracing::debug!(max, "connection pool exhausted");
                return Outcome::Err(pool_error(
                    PoolErrorKind::Exhausted,
                    format!("all {max} connections are in use"),
                ));
            }
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                tracing::debug!(
                    max,
                    timeout_ms = self.inner.config.acquire_timeout_ms,
                    "timed out waiting for a connection"
                );
                return Outcome::Err(pool_error(
                    PoolErrorKind::Timeout,
                    format!(
                        "no connection became free within {}ms (all {max} in use)",
                        self.inner.config.acquire_timeout_ms
                    ),
                ));
            }
            waited = true;
            sleep(cx.now(), (timeout - elapsed).min(ACQUIRE_POLL_INTERVAL)).await;
        }
    }

    /// One acquisition attempt; `None` when every slot is taken.
    async fn try_acquire(&self, cx: &Cx) -> Outcome<Option<PooledConnection<F>>, Error> {
        loop {
            let candidate = {
                let now = Instant::now();
                let mut idle = self.inner.idle();
                let mut found = None;
                while let Some(entry) = idle.pop() {
                    if self.inner.expired(&entry, now) {
                        self.inner.release_slot();
                        tracing::trace!("closing expired idle connection");
                        continue;
                    }
                    found = Some(entry);
                    break;
                }
                found
            };
            let Some(entry) = candidate else { break };
            if self.inner.config.test_on_checkout && !entry.conn.is_valid(cx).await {
                self.inner.release_slot();
                tracing::debug!("discarding connection that failed its checkout ping");
                continue;
            }
            self.inner.acquisitions.fetch_add(1, Ordering::Relaxed);
            return Outcome::Ok(Some(PooledConnection::new(Arc::clone(&self.inner), entry)));
        }

        if !self.inner.reserve() {
            return Outcome::Ok(None);
        }
        match self.open(cx).await {
            Outcome::Ok(entry) => {
                self.inner.acquisitions.fetch_add(1, Ordering::Relaxed);
                Outcome::Ok(Some(PooledConnection::new(Arc::clone(&self.inner), entry)))
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Open connections until `min_connections` are idle or in use.
    pub async fn warm_up(&self, cx: &Cx) -> Outcome<usize, Error> {
        let mut opened = 0;
        while self.inner.total.load(Ordering::Acquire) < self.inner.config.min_connections {
            if !self.inner.reserve() {
                break;
            }
            match self.open(cx).await {
                Outcome::Ok(entry) => {
                    self.inner.idle().push(entry);
                    opened += 1;
                }
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok(opened)
    }

    /// Close the pool. Idle connections are dropped; borrowed ones close on return.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let drained = std::mem::take(&mut *self.inner.idle());
        for _ in &drained {
            self.inner.release_slot();
        }
        tracing::debug!(closed = drained.len(), "connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Open a physical connection into an already reserved slot.
    async fn open(&self, cx: &Cx) -> Outcome<IdleConnection<F::Connection>, Error> {
        let outcome = self
            .inner
            .factory
            .connect(cx, &self.inner.connection_string)
            .await;
        match outcome {
            Outcome::Ok(conn) => {
                self.inner.created.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("opened pooled connection");
                let now = Instant::now();
                Outcome::Ok(IdleConnection {
                    conn,
                    created_at: now,
                    idle_since: now,
                })
            }
            Outcome::Err(e) => {
                self.inner.release_slot();
                Outcome::Err(e)
            }
            Outcome::Cancelled(r) => {
                self.inner.release_slot();
                Outcome::Cancelled(r)
            }
            Outcome::Panicked(p) => {
                self.inner.release_slot();
                Outcome::Panicked(p)
            }
        }
    }
}

fn pool_error(kind: PoolErrorKind, message: impl Into<String>) -> Error {
    Error::Pool(PoolError {
        kind,
        message: message.into(),
    })
}

/// A connection borrowed from the pool.
///
/// Returns to the pool's idle list on drop, or closes if the pool was closed meanwhile.
pub struct PooledConnection<F: ConnectionFactory> {
    pool: Arc<PoolInner<F>>,
    entry: Option<IdleConnection<F::Connection>>,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    fn new(pool: Arc<PoolInner<F>>, entry: IdleConnection<F::Connection>) -> Self {
        Self {
            pool,
            entry: Some(entry),
        }
    }

    /// Detach the connection from the pool, freeing its slot.
    pub fn into_inner(mut self) -> Option<F::Connection> {
        let entry = self.entry.take()?;
        self.pool.release_slot();
        Some(entry.conn)
    }

    /// Drop the connection instead of returning it, e.g. after a broken transaction.
    pub fn discard(mut self) {
        if self.entry.take().is_some() {
            self.pool.release_slot();
        }
    }
}

impl<F: ConnectionFactory> std::ops::Deref for PooledConnection<F> {
    type Target = F::Connection;

    fn deref(&self) -> &Self::Target {
        // `entry` is only vacated by consuming methods.
        match &self.entry {
            Some(entry) => &entry.conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        let Some(mut entry) = self.entry.take() else {
            return;
        };
        if self.pool.closed.load(Ordering::Acquire) {
            self.pool.release_slot();
            return;
        }
        entry.idle_since = Instant::now();
        self.pool.idle().push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use datamapper_core::{Row, Value};

    struct MockConn {
        healthy: Arc<AtomicBool>,
    }

    impl Connection for MockConn {
        async fn query(&self, _cx: &Cx, _sql: &str, _p: &[Value]) -> Outcome<Vec<Row>, Error> {
            Outcome::Ok(Vec::new())
        }
        async fn execute(&self, _cx: &Cx, _sql: &str, _p: &[Value]) -> Outcome<u64, Error> {
            Outcome::Ok(0)
        }
        async fn insert(&self, _cx: &Cx, _sql: &str, _p: &[Value]) -> Outcome<i64, Error> {
            Outcome::Ok(0)
        }
        async fn batch(
            &self,
            _cx: &Cx,
            statements: &[(String, Vec<Value>)],
        ) -> Outcome<Vec<u64>, Error> {
            Outcome::Ok(vec![0; statements.len()])
        }
        async fn begin(&self, _cx: &Cx) -> Outcome<(), Error> {
            Outcome::Ok(())
        }
        async fn commit(&self, _cx: &Cx) -> Outcome<(), Error> {
            Outcome::Ok(())
        }
        async fn rollback(&self, _cx: &Cx) -> Outcome<(), Error> {
            Outcome::Ok(())
        }
        async fn ping(&self, _cx: &Cx) -> Outcome<(), Error> {
            if self.healthy.load(Ordering::SeqCst) {
                Outcome::Ok(())
            } else {
                Outcome::Err(Error::Custom("ping failed".into()))
            }
        }
    }

    struct MockFactory {
        healthy: Arc<AtomicBool>,
        fail: bool,
    }

    impl MockFactory {
        fn new() -> Self {
            Self {
                healthy: Arc::new(AtomicBool::new(true)),
                fail: false,
            }
        }
    }

    impl ConnectionFactory for MockFactory {
        type Connection = MockConn;

        async fn connect(&self, _cx: &Cx, _cs: &str) -> Outcome<MockConn, Error> {
            if self.fail {
                return Outcome::Err(Error::Custom("refused".into()));
            }
            Outcome::Ok(MockConn {
                healthy: Arc::clone(&self.healthy),
            })
        }
    }

    fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => panic!("unexpected error: {e}"),
            Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
            Outcome::Panicked(p) => panic!("panicked: {p:?}"),
        }
    }

    fn block_on<T>(f: impl Future<Output = T>) -> T {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        rt.block_on(f)
    }

    #[test]
    fn test_pool_config_builder() {
        let config = PoolConfig::new(20)
            .min_connections(5)
            .acquire_timeout(250)
            .idle_timeout(60_000)
            .max_lifetime(3_600_000)
            .test_on_checkout(false);
        assert_eq!(config.min_connections, 5);
        assert_eq!(config.acquire_timeout_ms, 250);
        assert_eq!(config.max_connections, 20);
        assert_eq!(config.idle_timeout_ms, 60_000);
        assert_eq!(config.max_lifetime_ms, 3_600_000);
        assert!(!config.test_on_checkout);
    }

    #[test]
    fn test_connection_is_reused_after_drop() {
        let pool = Pool::new(MockFactory::new(), "memory://a", PoolConfig::new(2));
        block_on(async {
            let cx = Cx::for_testing();
            let first = unwrap_outcome(pool.acquire(&cx).await);
            assert_eq!(pool.stats().active_connections, 1);
            drop(first);
            assert_eq!(pool.stats().idle_connections, 1);
            let _again = unwrap_outcome(pool.acquire(&cx).await);
            let stats = pool.stats();
            assert_eq!(stats.connections_created, 1);
            assert_eq!(stats.acquisitions, 2);
        });
    }

    #[test]
    fn test_zero_acquire_timeout_fails_fast() {
        let config = PoolConfig::new(1).acquire_timeout(0);
        let pool = Pool::new(MockFactory::new(), "memory://a", config);
        block_on(async {
            let cx = Cx::for_testing();
            let _held = unwrap_outcome(pool.acquire(&cx).await);
            assert!(pool.at_capacity());
            match pool.acquire(&cx).await {
                Outcome::Err(Error::Pool(e)) => assert_eq!(e.kind, PoolErrorKind::Exhausted),
                _ => panic!("expected exhaustion"),
            }
        });
    }

    #[test]
    fn test_waiting_acquire_gets_released_connection() {
        let config = PoolConfig::new(1).acquire_timeout(5_000);
        let pool = Pool::new(MockFactory::new(), "memory://a", config);
        let cx = Cx::for_testing();
        let held = unwrap_outcome(block_on(pool.acquire(&cx)));

        std::thread::scope(|s| {
            s.spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                drop(held);
            });
            let second = unwrap_outcome(block_on(pool.acquire(&cx)));
            assert_eq!(pool.stats().active_connections, 1);
            drop(second);
        });
        let stats = pool.stats();
        assert_eq!(stats.connections_created, 1);
        assert_eq!(stats.acquisitions, 2);
    }

    #[test]
    fn test_acquire_times_out_when_nothing_is_returned() {
        let config = PoolConfig::new(1).acquire_timeout(25);
        let pool = Pool::new(MockFactory::new(), "memory://a", config);
        block_on(async {
            let cx = Cx::for_testing();
            let _held = unwrap_outcome(pool.acquire(&cx).await);
            let started = Instant::now();
            match pool.acquire(&cx).await {
                Outcome::Err(Error::Pool(e)) => assert_eq!(e.kind, PoolErrorKind::Timeout),
                _ => panic!("expected acquire timeout"),
            }
            assert!(started.elapsed() >= Duration::from_millis(25));
        });
    }

    #[test]
    fn test_cancelled_waiter_stops_waiting() {
        let config = PoolConfig::new(1).acquire_timeout(10_000);
        let pool = Pool::new(MockFactory::new(), "memory://a", config);
        let cx = Cx::for_testing();
        let _held = unwrap_outcome(block_on(pool.acquire(&cx)));

        let canceller = cx.clone();
        std::thread::scope(|s| {
            s.spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                canceller.cancel_with(asupersync::CancelKind::User, Some("shutting down"));
            });
            let started = Instant::now();
            assert!(matches!(block_on(pool.acquire(&cx)), Outcome::Cancelled(_)));
            assert!(started.elapsed() < Duration::from_secs(5));
        });
        assert_eq!(pool.stats().total_connections, 1);
    }

    #[test]
    fn test_unhealthy_idle_connection_is_replaced() {
        let factory = MockFactory::new();
        let healthy = Arc::clone(&factory.healthy);
        let pool = Pool::new(factory, "memory://a", PoolConfig::new(1));
        block_on(async {
            let cx = Cx::for_testing();
            drop(unwrap_outcome(pool.acquire(&cx).await));
            healthy.store(false, Ordering::SeqCst);
            // Fresh connections skip the checkout ping; only the idle one is tested.
            let _replaced = unwrap_outcome(pool.acquire(&cx).await);
            assert_eq!(pool.stats().connections_created, 2);
        });
    }

    #[test]
    fn test_failed_connect_frees_slot() {
        let mut factory = MockFactory::new();
        factory.fail = true;
        let pool = Pool::new(factory, "memory://a", PoolConfig::new(1));
        block_on(async {
            let cx = Cx::for_testing();
            assert!(matches!(pool.acquire(&cx).await, Outcome::Err(_)));
            assert_eq!(pool.stats().total_connections, 0);
        });
    }

    #[test]
    fn test_closed_pool_rejects_and_drops_returns() {
        let pool = Pool::new(MockFactory::new(), "memory://a", PoolConfig::new(2));
        block_on(async {
            let cx = Cx::for_testing();
            let held = unwrap_outcome(pool.acquire(&cx).await);
            pool.close();
            match pool.acquire(&cx).await {
                Outcome::Err(Error::Pool(e)) => assert_eq!(e.kind, PoolErrorKind::Closed),
                _ => panic!("expected closed pool error"),
            }
            drop(held);
            assert_eq!(pool.stats().total_connections, 0);
        });
    }

    #[test]
    fn test_warm_up_opens_min_connections() {
        let pool = Pool::new(
            MockFactory::new(),
            "memory://a",
            PoolConfig::new(4).min_connections(3),
        );
        block_on(async {
            let cx = Cx::for_testing();
            assert_eq!(unwrap_outcome(pool.warm_up(&cx).await), 3);
            assert_eq!(pool.stats().idle_connections, 3);
        });
    }

    #[test]
    fn test_discard_frees_slot() {
        let pool = Pool::new(MockFactory::new(), "memory://a", PoolConfig::new(1));
        block_on(async {
            let cx = Cx::for_testing();
            unwrap_outcome(pool.acquire(&cx).await).discard();
            assert_eq!(pool.stats().total_connections, 0);
            assert!(matches!(pool.acquire(&cx).await, Outcome::Ok(_)));
        });
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: PoolConfig =
            serde_json::from_str(r#"{"max_connections": 3}"#).unwrap();
        assert_eq!(config.max_connections, 3);
        assert_eq!(config.min_connections, 1);
        assert_eq!(config.acquire_timeout_ms, 30_000);
    }
}
