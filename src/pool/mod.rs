//! Connection pool with retrying acquisition and per-connection initialization.
//!
//! - [`ConnectionPool`] - bounded pool on top of `deadpool`
//! - [`PooledConnection`] - leased handle, released explicitly or on drop
//! - [`ExtensionInitializer`] - per-connection setup run on every fresh session
//! - [`PoolHooks`] - lifecycle observers
//! - [`PoolScope`] - owner that closes every pool of one unit of work

mod backoff;
mod connection;
mod hooks;
pub mod initializer;
mod manager;
mod scope;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use deadpool::managed::{Pool, PoolError, TimeoutType};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use ulid::Ulid;

pub use backoff::Backoff;
pub use connection::{ConnectionState, PooledConnection};
pub use hooks::{HookError, PoolHooks};
pub use initializer::{
    default_initializers, AgeExtension, ExtensionInitializer, ScratchTable, SearchPath,
    SecondaryExtension,
};
pub use manager::{SessionError, SessionManager, TrackedSession};
pub use scope::{PoolScope, Shutdown};

use crate::config::Config;
use crate::error::{BridgeError, EngineError};
use crate::session::{Connector, PgConnector};
use hooks::HookEvent;
use manager::Shared;

/// Sizing, timeouts and retry policy for one pool.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_size: usize,
    /// Pooled connections unused for longer than this are replaced on checkout.
    pub idle_timeout: Duration,
    /// Longest wait for a free slot once the pool is at capacity.
    pub acquire_timeout: Duration,
    /// Limit on opening and initializing one physical connection.
    pub connect_timeout: Option<Duration>,
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl PoolSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_size: config.pool.max_size,
            idle_timeout: config.pool.idle_timeout(),
            acquire_timeout: config.pool.acquire_timeout(),
            connect_timeout: config.postgres.connect_timeout_ms.map(Duration::from_millis),
            max_attempts: config.retry.max_attempts,
            backoff: Backoff::from_config(&config.retry),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Pool statistics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Physical connections currently open.
    pub total: usize,
    pub idle: usize,
    /// Connections leased and not yet released.
    pub active: usize,
    /// Callers waiting for a free slot.
    pub waiting: usize,
    pub max: usize,
}

/// Bounded pool of initialized sessions.
///
/// Cheap to clone; clones share the same pool.
pub struct ConnectionPool<C: Connector> {
    pool: Pool<SessionManager<C>>,
    shared: Arc<Shared<C>>,
}

impl<C: Connector> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl ConnectionPool<PgConnector> {
    /// Builds a PostgreSQL pool from configuration with the default initializers.
    pub fn from_config(name: &str, config: &Config) -> Result<Self, BridgeError> {
        let connector = PgConnector::from_config(&config.postgres)?;
        Self::new(
            name,
            connector,
            PoolSettings::from_config(config),
            default_initializers(&config.session),
        )
    }
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(
        name: &str,
        connector: C,
        settings: PoolSettings,
        initializers: Vec<Arc<dyn ExtensionInitializer>>,
    ) -> Result<Self, BridgeError> {
        if settings.max_size == 0 {
            return Err(BridgeError::invalid_config("pool max_size must be at least 1"));
        }
        let shared = Arc::new(Shared {
            name: name.to_string(),
            id: Ulid::new(),
            connector,
            settings,
            initializers,
            hooks: RwLock::new(Vec::new()),
            leases: Mutex::new(HashSet::new()),
        });
        let pool = Pool::builder(SessionManager {
            shared: shared.clone(),
        })
        .max_size(shared.settings.max_size)
        .wait_timeout(Some(shared.settings.acquire_timeout))
        .create_timeout(shared.settings.connect_timeout)
        .runtime(deadpool::Runtime::Tokio1)
        .build()
        .map_err(|e| BridgeError::invalid_config(format!("failed to build pool '{}': {}", name, e)))?;

        tracing::info!(
            pool = %name,
            target = %shared.connector.describe(),
            max_size = shared.settings.max_size,
            initializers = shared.initializers.len(),
            "Connection pool created"
        );
        Ok(Self { pool, shared })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn id(&self) -> Ulid {
        self.shared.id
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.shared.settings
    }

    pub fn register_hooks(&self, hooks: Arc<dyn PoolHooks>) {
        self.shared.hooks.write().push(hooks);
    }

    /// Leases a connection, retrying transient connect failures with backoff.
    ///
    /// # Errors
    ///
    /// - `ConnectionError` when every attempt failed, or a critical initializer failed
    /// - `PoolError` when no slot freed up within the acquire timeout, or the pool is closed
    pub async fn acquire(&self) -> Result<PooledConnection<C>, BridgeError> {
        let settings = &self.shared.settings;
        let max_attempts = settings.max_attempts.max(1);
        let mut last_cause: Option<EngineError> = None;
        let mut last_message = String::new();

        for attempt in 1..=max_attempts {
            match self.pool.get().await {
                Ok(obj) => {
                    let conn = PooledConnection::new(obj, self.shared.clone());
                    tracing::trace!(pool = %self.shared.name, lease = %conn.lease_id(), attempt, "Connection acquired");
                    return Ok(conn);
                }
                Err(PoolError::Backend(SessionError::Initializer { name, source })) => {
                    let err = BridgeError::Connection {
                        message: format!("critical initializer '{}' failed: {}", name, source.message),
                        attempts: attempt,
                        source: Some(source),
                    };
                    return Err(self.fail(err).await);
                }
                Err(PoolError::Backend(SessionError::Connect(cause))) => {
                    last_message = cause.message.clone();
                    last_cause = Some(cause);
                }
                Err(PoolError::Backend(err)) => {
                    last_message = err.to_string();
                }
                Err(PoolError::Timeout(TimeoutType::Create)) => {
                    last_message = format!(
                        "timed out opening connection after {:?}",
                        settings.connect_timeout.unwrap_or_default()
                    );
                }
                Err(PoolError::Timeout(TimeoutType::Wait)) => {
                    let err = BridgeError::pool(format!(
                        "timed out after {:?} waiting for a free connection (max {})",
                        settings.acquire_timeout, settings.max_size
                    ));
                    return Err(self.fail(err).await);
                }
                Err(PoolError::Closed) => {
                    return Err(BridgeError::pool(format!("pool '{}' is closed", self.shared.name)));
                }
                Err(other) => {
                    let err = BridgeError::pool(other.to_string());
                    return Err(self.fail(err).await);
                }
            }

            if attempt < max_attempts {
                let delay = settings.backoff.delay(attempt);
                tracing::warn!(
                    pool = %self.shared.name,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %last_message,
                    "Connection attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }

        let err = BridgeError::Connection {
            message: format!(
                "could not connect to {}: {}",
                self.shared.connector.describe(),
                last_message
            ),
            attempts: max_attempts,
            source: last_cause,
        };
        Err(self.fail(err).await)
    }

    async fn fail(&self, err: BridgeError) -> BridgeError {
        tracing::error!(pool = %self.shared.name, error = %err, "Acquisition failed");
        self.shared.fire(HookEvent::Error(&err)).await;
        err
    }

    /// Returns a connection to the pool.
    ///
    /// Initializer cleanups run first; if one fails, or the connection is marked
    /// `Error` or still inside a transaction, it is discarded instead.
    ///
    /// # Errors
    ///
    /// `PoolError` when the connection was leased from a different pool. The
    /// handle is then returned to its own pool and this pool's statistics are
    /// left untouched.
    pub async fn release(&self, mut conn: PooledConnection<C>) -> Result<(), BridgeError> {
        if conn.pool_id() != self.shared.id {
            let owner = conn.pool_name().to_string();
            drop(conn.detach());
            return Err(BridgeError::pool(format!(
                "connection belongs to pool '{}', not '{}'",
                owner, self.shared.name
            )));
        }

        let discard = conn.must_discard();
        let in_transaction = conn.in_transaction();
        let lease = conn.lease_id();
        let Some(mut obj) = conn.detach() else {
            return Err(BridgeError::pool("connection has already been released"));
        };

        if discard {
            tracing::warn!(pool = %self.shared.name, %lease, in_transaction, "Discarding connection on release");
            self.discard(obj).await;
            return Ok(());
        }

        if let Err((initializer, err)) = self.shared.cleanup(obj.session()).await {
            tracing::warn!(
                pool = %self.shared.name,
                %lease,
                initializer = %initializer,
                error = %err,
                "Release cleanup failed, discarding connection"
            );
            self.discard(obj).await;
            return Ok(());
        }

        tracing::trace!(pool = %self.shared.name, %lease, "Connection released");
        obj.mark_returned(true);
        drop(obj);
        Ok(())
    }

    async fn discard(&self, obj: deadpool::managed::Object<SessionManager<C>>) {
        self.shared.fire(HookEvent::BeforeDisconnect).await;
        drop(deadpool::managed::Object::take(obj));
        self.shared.fire(HookEvent::AfterDisconnect).await;
    }

    pub fn stats(&self) -> PoolStats {
        let status = self.pool.status();
        PoolStats {
            total: status.size,
            idle: status.available,
            active: self.shared.leases.lock().len(),
            waiting: status.waiting,
            max: status.max_size,
        }
    }

    /// Closes the pool. Idle connections are dropped immediately; leased ones
    /// are dropped when they come back. Further acquires fail.
    pub async fn close(&self) {
        if self.pool.is_closed() {
            return;
        }
        self.shared.fire(HookEvent::BeforeDisconnect).await;
        self.pool.close();
        self.shared.fire(HookEvent::AfterDisconnect).await;
        tracing::info!(pool = %self.shared.name, "Connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::error::ErrorKind;
    use crate::session::mock::MockConnector;
    use crate::session::Session;
    use crate::value::Value;

    fn settings(max_size: usize) -> PoolSettings {
        PoolSettings {
            max_size,
            idle_timeout: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(5),
            connect_timeout: None,
            max_attempts: 3,
            backoff: Backoff {
                base: Duration::from_millis(100),
                max: Duration::from_secs(5),
                factor: 2.0,
                jitter: 0.0,
            },
        }
    }

    fn pool(mock: &MockConnector, settings: PoolSettings) -> ConnectionPool<MockConnector> {
        ConnectionPool::new("test", mock.clone(), settings, vec![Arc::new(ScratchTable)]).unwrap()
    }

    #[derive(Default)]
    struct Counting {
        connects: AtomicU32,
        disconnects: AtomicU32,
        errors: AtomicU32,
    }

    #[async_trait]
    impl PoolHooks for Counting {
        async fn after_connect(&self, _pool: &str) -> Result<(), HookError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn after_disconnect(&self, _pool: &str) -> Result<(), HookError> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_error(&self, _pool: &str, _error: &BridgeError) -> Result<(), HookError> {
            self.errors.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl PoolHooks for Failing {
        async fn before_connect(&self, _pool: &str) -> Result<(), HookError> {
            Err("hook exploded".into())
        }
    }

    struct BrokenCritical;

    #[async_trait]
    impl ExtensionInitializer for BrokenCritical {
        fn name(&self) -> &str {
            "broken"
        }

        fn is_critical(&self) -> bool {
            true
        }

        async fn initialize(&self, _session: &dyn Session) -> Result<(), EngineError> {
            Err(EngineError::with_code("58P01", "could not access file \"age\""))
        }
    }

    #[tokio::test]
    async fn test_acquire_runs_initializers_once_per_connection() {
        let mock = MockConnector::new();
        let pool = pool(&mock, settings(1));

        let conn = pool.acquire().await.unwrap();
        pool.release(conn).await.unwrap();
        let conn = pool.acquire().await.unwrap();
        pool.release(conn).await.unwrap();

        assert_eq!(mock.connects(), 1);
        let creates = mock
            .statements()
            .iter()
            .filter(|s| s.starts_with("CREATE TEMP TABLE"))
            .count();
        assert_eq!(creates, 1);
        let truncates = mock
            .statements()
            .iter()
            .filter(|s| s.starts_with("TRUNCATE"))
            .count();
        assert_eq!(truncates, 2);
    }

    #[tokio::test]
    async fn test_max_size_blocks_until_release() {
        let mock = MockConnector::new();
        let pool = pool(&mock, settings(2));

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_eq!(pool.stats().active, 2);

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!waiter.is_finished());

        pool.release(a).await.unwrap();
        let c = waiter.await.unwrap().unwrap();
        let stats = pool.stats();
        assert_eq!(stats.active, 2);
        assert_eq!(stats.total, 2);
        assert!(stats.active <= stats.max);

        pool.release(b).await.unwrap();
        pool.release(c).await.unwrap();
        assert_eq!(pool.stats().active, 0);
        assert_eq!(pool.stats().idle, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_wait_timeout_is_pool_error() {
        let mock = MockConnector::new();
        let pool = pool(
            &mock,
            PoolSettings {
                acquire_timeout: Duration::from_millis(50),
                ..settings(1)
            },
        );
        let _held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Pool);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_transient_failures() {
        let mock = MockConnector::new();
        mock.fail_connects(2, EngineError::with_code("08001", "connection refused"));
        let pool = pool(&mock, settings(1));

        let started = tokio::time::Instant::now();
        let conn = pool.acquire().await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(mock.connects(), 3);
        assert!(elapsed >= pool.settings().backoff.min_total(2));
        pool.release(conn).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_reports_attempts_and_cause() {
        let mock = MockConnector::new();
        mock.fail_connects(10, EngineError::with_code("08001", "connection refused"));
        let pool = pool(&mock, settings(1));
        let hooks = Arc::new(Counting::default());
        pool.register_hooks(hooks.clone());

        let err = pool.acquire().await.unwrap_err();
        match &err {
            BridgeError::Connection {
                attempts, source, ..
            } => {
                assert_eq!(*attempts, 3);
                assert_eq!(source.as_ref().and_then(|s| s.code.as_deref()), Some("08001"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(mock.connects(), 3);
        assert_eq!(hooks.errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_is_retried() {
        let mock = MockConnector::new();
        mock.delay_connects(Duration::from_secs(10));
        let pool = pool(
            &mock,
            PoolSettings {
                connect_timeout: Some(Duration::from_millis(100)),
                max_attempts: 2,
                ..settings(1)
            },
        );
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, BridgeError::Connection { attempts: 2, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_initializer_failure_is_not_retried() {
        let mock = MockConnector::new();
        let pool = ConnectionPool::new("test", mock.clone(), settings(1), vec![Arc::new(BrokenCritical)])
            .unwrap();

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, BridgeError::Connection { attempts: 1, .. }));
        assert_eq!(err.engine().and_then(|e| e.code.as_deref()), Some("58P01"));
        assert_eq!(mock.connects(), 1);
    }

    #[tokio::test]
    async fn test_non_critical_initializer_failure_is_swallowed() {
        let mock = MockConnector::new();
        mock.fail_on("CREATE EXTENSION IF NOT EXISTS \"pg_trgm\"", EngineError::new("not available"), 1);
        let pool = ConnectionPool::new(
            "test",
            mock.clone(),
            settings(1),
            vec![Arc::new(SecondaryExtension("pg_trgm".into()))],
        )
        .unwrap();
        let conn = pool.acquire().await.unwrap();
        pool.release(conn).await.unwrap();
    }

    #[tokio::test]
    async fn test_release_foreign_connection_rejected() {
        let mock_a = MockConnector::new();
        let mock_b = MockConnector::new();
        let a = pool(&mock_a, settings(1));
        let b = pool(&mock_b, settings(1));

        let conn = a.acquire().await.unwrap();
        let before = b.stats();
        let err = b.release(conn).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Pool);
        assert_eq!(b.stats(), before);
        assert_eq!(a.stats().active, 0);
        assert_eq!(a.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_cleanup_failure_discards_connection() {
        let mock = MockConnector::new();
        let pool = pool(&mock, settings(1));
        let hooks = Arc::new(Counting::default());
        pool.register_hooks(hooks.clone());

        let conn = pool.acquire().await.unwrap();
        mock.fail_on("TRUNCATE", EngineError::new("relation does not exist"), 1);
        pool.release(conn).await.unwrap();

        assert_eq!(pool.stats().total, 0);
        assert_eq!(hooks.disconnects.load(Ordering::SeqCst), 1);
        let conn = pool.acquire().await.unwrap();
        assert_eq!(mock.connects(), 2);
        pool.release(conn).await.unwrap();
    }

    #[tokio::test]
    async fn test_errored_connection_is_discarded() {
        let mock = MockConnector::new();
        let pool = pool(&mock, settings(1));

        let mut conn = pool.acquire().await.unwrap();
        conn.mark_error();
        pool.release(conn).await.unwrap();
        assert_eq!(pool.stats().total, 0);
    }

    #[tokio::test]
    async fn test_drop_mid_transaction_discards() {
        let mock = MockConnector::new();
        let pool = pool(&mock, settings(1));

        let mut conn = pool.acquire().await.unwrap();
        conn.set_in_transaction(true);
        drop(conn);
        let stats = pool.stats();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.active, 0);
    }

    #[tokio::test]
    async fn test_drop_without_release_returns_to_pool() {
        let mock = MockConnector::new();
        let pool = pool(&mock, settings(1));

        let conn = pool.acquire().await.unwrap();
        drop(conn);
        assert_eq!(pool.stats().idle, 1);
        assert_eq!(pool.stats().active, 0);
    }

    fn truncates(mock: &MockConnector) -> usize {
        mock.statements()
            .iter()
            .filter(|s| s.starts_with("TRUNCATE"))
            .count()
    }

    #[tokio::test]
    async fn test_dropped_lease_cleaned_on_next_checkout() {
        let mock = MockConnector::new();
        let pool = pool(&mock, settings(1));

        let conn = pool.acquire().await.unwrap();
        let id = conn.session().unwrap().id;
        drop(conn);
        assert_eq!(truncates(&mock), 0);

        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.session().unwrap().id, id);
        assert_eq!(truncates(&mock), 1);
        pool.release(conn).await.unwrap();
        assert_eq!(truncates(&mock), 2);

        // A released session is already clean.
        let conn = pool.acquire().await.unwrap();
        assert_eq!(truncates(&mock), 2);
        pool.release(conn).await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_lease_replaced_when_deferred_cleanup_fails() {
        let mock = MockConnector::new();
        let pool = pool(&mock, settings(1));

        drop(pool.acquire().await.unwrap());
        mock.fail_on("TRUNCATE", EngineError::new("relation does not exist"), 1);

        let conn = pool.acquire().await.unwrap();
        assert_eq!(mock.connects(), 2);
        pool.release(conn).await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_time_counts_from_release() {
        let mock = MockConnector::new();
        let pool = pool(
            &mock,
            PoolSettings {
                idle_timeout: Duration::from_millis(50),
                ..settings(1)
            },
        );
        let conn = pool.acquire().await.unwrap();
        std::thread::sleep(Duration::from_millis(80));
        pool.release(conn).await.unwrap();

        let conn = pool.acquire().await.unwrap();
        assert_eq!(mock.connects(), 1);
        pool.release(conn).await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_session_replaced_on_checkout() {
        let mock = MockConnector::new();
        let pool = pool(&mock, settings(1));

        let conn = pool.acquire().await.unwrap();
        let id = conn.session().unwrap().id;
        pool.release(conn).await.unwrap();
        mock.close_session(id);

        let conn = pool.acquire().await.unwrap();
        assert_ne!(conn.session().unwrap().id, id);
        assert_eq!(mock.connects(), 2);
        pool.release(conn).await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_connection_replaced() {
        let mock = MockConnector::new();
        let pool = pool(
            &mock,
            PoolSettings {
                idle_timeout: Duration::ZERO,
                ..settings(1)
            },
        );
        let conn = pool.acquire().await.unwrap();
        pool.release(conn).await.unwrap();
        std::thread::sleep(Duration::from_millis(2));
        let conn = pool.acquire().await.unwrap();
        assert_eq!(mock.connects(), 2);
        pool.release(conn).await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_hook_does_not_break_acquire() {
        let mock = MockConnector::new();
        let pool = pool(&mock, settings(1));
        pool.register_hooks(Arc::new(Failing));
        let counting = Arc::new(Counting::default());
        pool.register_hooks(counting.clone());

        let conn = pool.acquire().await.unwrap();
        pool.release(conn).await.unwrap();
        assert_eq!(counting.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stash_round_trip() {
        let mock = MockConnector::new();
        mock.respond(|sql, _params| {
            sql.starts_with("SELECT value").then(|| {
                crate::row::QueryResult::from_rows(
                    vec!["value".into()],
                    vec![crate::row::Row::from_pairs([("value", Value::from("v"))])],
                )
            })
        });
        let pool = pool(&mock, settings(1));
        let mut conn = pool.acquire().await.unwrap();
        conn.stash("k", "v").await.unwrap();
        assert_eq!(conn.stashed("k").await.unwrap().as_deref(), Some("v"));
        assert!(mock.statements().iter().any(|s| s.starts_with("INSERT INTO _age_bridge_scratch")));
        pool.release(conn).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_rejects_acquire() {
        let mock = MockConnector::new();
        let pool = pool(&mock, settings(1));
        pool.close().await;
        assert!(pool.is_closed());
        let err = pool.acquire().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Pool);
    }
}
